//! In-memory position store for tests and dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use helmsman_core::{
    Position, PositionStatus, PositionStore, PositionWithTiers, TierModification, TierRecord,
    TradeOperation,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Mirrors the durable store's contract over plain maps. Every read hands
/// out clones so callers cannot alias internal state.
#[derive(Default)]
pub struct MemoryPositionStore {
    orders: Mutex<HashMap<i64, Position>>,
    tiers: Mutex<HashMap<i64, TierRecord>>,
    operations: Mutex<Vec<TradeOperation>>,
    modifications: Mutex<Vec<TierModification>>,
}

impl MemoryPositionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: full operation log.
    #[must_use]
    pub fn operations(&self) -> Vec<TradeOperation> {
        self.operations.lock().clone()
    }

    /// Test helper: tier record for one trade.
    #[must_use]
    pub fn tiers_for(&self, trade_id: i64) -> Option<TierRecord> {
        self.tiers.lock().get(&trade_id).copied()
    }

    /// Test helper: order row for one trade.
    #[must_use]
    pub fn order_for(&self, trade_id: i64) -> Option<Position> {
        self.orders.lock().get(&trade_id).cloned()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn upsert_order(&self, position: &Position) -> Result<()> {
        self.orders
            .lock()
            .insert(position.trade_id, position.clone());
        Ok(())
    }

    async fn update_order_status(&self, trade_id: i64, status: PositionStatus) -> Result<()> {
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(&trade_id) else {
            bail!("no order for trade {trade_id}");
        };
        order.status = status;
        Ok(())
    }

    async fn upsert_tiers(&self, trade_id: i64, _symbol: &str, tiers: &TierRecord) -> Result<()> {
        self.tiers.lock().insert(trade_id, *tiers);
        Ok(())
    }

    async fn save_position(&self, position: &Position, tiers: &TierRecord) -> Result<()> {
        self.upsert_order(position).await?;
        self.upsert_tiers(position.trade_id, &position.symbol, tiers)
            .await
    }

    async fn get_live_position(&self, trade_id: i64) -> Result<Option<PositionWithTiers>> {
        let orders = self.orders.lock();
        let Some(position) = orders.get(&trade_id) else {
            return Ok(None);
        };
        let tiers = self
            .tiers
            .lock()
            .get(&trade_id)
            .copied()
            .unwrap_or_default();
        Ok(Some(PositionWithTiers {
            position: position.clone(),
            tiers,
        }))
    }

    async fn list_active_positions(&self) -> Result<Vec<PositionWithTiers>> {
        let orders = self.orders.lock();
        let tiers = self.tiers.lock();
        Ok(orders
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .map(|p| PositionWithTiers {
                position: p.clone(),
                tiers: tiers.get(&p.trade_id).copied().unwrap_or_default(),
            })
            .collect())
    }

    async fn append_trade_operation(&self, op: &TradeOperation) -> Result<()> {
        self.operations.lock().push(op.clone());
        Ok(())
    }

    async fn insert_tier_modification(&self, log: &TierModification) -> Result<()> {
        self.modifications.lock().push(log.clone());
        Ok(())
    }

    async fn list_trade_operations(
        &self,
        trade_id: i64,
        limit: usize,
    ) -> Result<Vec<TradeOperation>> {
        let ops = self.operations.lock();
        let mut out: Vec<TradeOperation> = ops
            .iter()
            .filter(|op| op.trade_id == trade_id)
            .cloned()
            .collect();
        if limit > 0 && out.len() > limit {
            out = out.split_off(out.len() - limit);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use helmsman_core::Side;

    fn position(trade_id: i64) -> Position {
        Position {
            trade_id,
            symbol: "ETHUSDT".to_string(),
            side: Side::Long,
            entry_price: 2840.64,
            initial_amount: 1.0,
            current_amount: 1.0,
            closed_amount: 0.0,
            stake: 1000.0,
            leverage: 5.0,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_fetch_round_trip() {
        let store = MemoryPositionStore::new();
        store
            .save_position(&position(1), &TierRecord::default())
            .await
            .unwrap();
        let found = store.get_live_position(1).await.unwrap().unwrap();
        assert_eq!(found.position.trade_id, 1);
        assert!(store.get_live_position(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_listing_excludes_closed() {
        let store = MemoryPositionStore::new();
        store
            .save_position(&position(1), &TierRecord::default())
            .await
            .unwrap();
        let mut closed = position(2);
        closed.status = PositionStatus::Closed;
        store
            .save_position(&closed, &TierRecord::default())
            .await
            .unwrap();
        let active = store.list_active_positions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].position.trade_id, 1);
    }

    #[tokio::test]
    async fn status_update_requires_existing_order() {
        let store = MemoryPositionStore::new();
        assert!(store
            .update_order_status(99, PositionStatus::Closed)
            .await
            .is_err());
    }
}
