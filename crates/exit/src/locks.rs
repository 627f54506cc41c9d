//! Per-trade lock striping.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Hands out one async mutex per trade id so exit decisions for a single
/// position are strictly serial while different trades run concurrently.
///
/// Locks are never dropped for the life of the controller; the map stays
/// small because trade ids are bounded by open-position count.
#[derive(Default)]
pub struct PositionLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl PositionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lock_for(&self, trade_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(trade_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_trade_gets_the_same_lock() {
        let locks = PositionLocks::new();
        let a = locks.lock_for(7);
        let b = locks.lock_for(7);
        assert!(Arc::ptr_eq(&a, &b));
        let c = locks.lock_for(8);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn lock_serializes_critical_sections() {
        let locks = Arc::new(PositionLocks::new());
        let counter = Arc::new(parking_lot::Mutex::new(0i32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let lock = locks.lock_for(1);
                let _guard = lock.lock().await;
                let mut value = counter.lock();
                *value += 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock(), 8);
    }
}
