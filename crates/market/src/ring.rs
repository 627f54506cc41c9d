//! Bounded in-memory candle sequences keyed by (symbol, interval).

use anyhow::{bail, Result};
use helmsman_core::Candle;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe mapping from `(symbol, interval)` to a bounded, time-ordered
/// candle sequence.
///
/// Append semantics: an incoming candle whose `open_time_ms` equals the last
/// element's overwrites it (incremental update of the streaming tail bar);
/// otherwise it is appended. Oldest entries are dropped past capacity.
pub struct CandleRing {
    capacity: usize,
    data: RwLock<HashMap<String, Vec<Candle>>>,
}

fn key(symbol: &str, interval: &str) -> String {
    format!("{symbol}@{interval}")
}

impl CandleRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { 100 } else { capacity },
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Appends candles with replace-last semantics, then trims to capacity.
    ///
    /// # Errors
    /// Rejects empty symbol or interval.
    pub fn put(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<()> {
        if symbol.is_empty() || interval.is_empty() {
            bail!("symbol and interval are required");
        }
        if candles.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write();
        let seq = data.entry(key(symbol, interval)).or_default();
        for candle in candles {
            match seq.last_mut() {
                Some(last) if last.open_time_ms == candle.open_time_ms => *last = *candle,
                _ => seq.push(*candle),
            }
        }
        if seq.len() > self.capacity {
            let excess = seq.len() - self.capacity;
            seq.drain(..excess);
        }
        Ok(())
    }

    /// Replaces the whole sequence for one key.
    ///
    /// # Errors
    /// Rejects empty symbol or interval.
    pub fn set(&self, symbol: &str, interval: &str, candles: Vec<Candle>) -> Result<()> {
        if symbol.is_empty() || interval.is_empty() {
            bail!("symbol and interval are required");
        }
        self.data.write().insert(key(symbol, interval), candles);
        Ok(())
    }

    /// Returns a copy of the full sequence (empty when unknown).
    #[must_use]
    pub fn get(&self, symbol: &str, interval: &str) -> Vec<Candle> {
        self.data
            .read()
            .get(&key(symbol, interval))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a copy of the most recent `limit` candles, ascending.
    #[must_use]
    pub fn export(&self, symbol: &str, interval: &str, limit: usize) -> Vec<Candle> {
        if limit == 0 {
            return Vec::new();
        }
        let data = self.data.read();
        let Some(seq) = data.get(&key(symbol, interval)) else {
            return Vec::new();
        };
        let start = seq.len().saturating_sub(limit);
        seq[start..].to_vec()
    }
}
