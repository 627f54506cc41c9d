use crate::error::{BrokerError, SourceError};
use crate::events::{Candle, CandleEvent, SourceStats, SubscribeOptions, TradeTick};
use crate::position::{OperationKind, Position, PositionStatus, PositionWithTiers, TierRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capability set for an upstream market-data venue.
///
/// The combined-streams implementation is one variant; a replay
/// implementation backs tests.
#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Fetches up to `limit` most recent candles, ascending by open time.
    async fn fetch_history(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError>;

    /// Subscribes to live klines for every symbol x interval pair. The
    /// returned channel closes when the subscription ends.
    async fn subscribe(
        &self,
        symbols: &[String],
        intervals: &[String],
        opts: SubscribeOptions,
    ) -> Result<mpsc::Receiver<CandleEvent>, SourceError>;

    /// Subscribes to the live aggregated-trade stream for the symbols.
    async fn subscribe_trades(
        &self,
        symbols: &[String],
        opts: SubscribeOptions,
    ) -> Result<mpsc::Receiver<TradeTick>, SourceError>;

    fn stats(&self) -> SourceStats;

    /// Releases underlying connections. Idempotent.
    async fn close(&self);
}

/// One row in the trade operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOperation {
    pub trade_id: i64,
    pub symbol: String,
    pub kind: OperationKind,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Audit row for a change to a position's exit levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierModification {
    pub trade_id: i64,
    pub symbol: String,
    pub field: String,
    pub old_value: f64,
    pub new_value: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Narrow interface onto the durable position/tier store.
///
/// All operations must be safe under concurrent access by trade id.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn upsert_order(&self, position: &Position) -> Result<()>;

    async fn update_order_status(&self, trade_id: i64, status: PositionStatus) -> Result<()>;

    async fn upsert_tiers(&self, trade_id: i64, symbol: &str, tiers: &TierRecord) -> Result<()>;

    /// Writes the order and its tiers together.
    async fn save_position(&self, position: &Position, tiers: &TierRecord) -> Result<()>;

    async fn get_live_position(&self, trade_id: i64) -> Result<Option<PositionWithTiers>>;

    /// Positions not yet closed.
    async fn list_active_positions(&self) -> Result<Vec<PositionWithTiers>>;

    async fn append_trade_operation(&self, op: &TradeOperation) -> Result<()>;

    async fn insert_tier_modification(&self, log: &TierModification) -> Result<()>;

    async fn list_trade_operations(
        &self,
        trade_id: i64,
        limit: usize,
    ) -> Result<Vec<TradeOperation>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceEnterRequest {
    pub pair: String,
    pub side: String,
    pub stake_amount: f64,
    pub order_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTrade {
    pub trade_id: i64,
    pub pair: String,
    #[serde(default)]
    pub is_short: bool,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub stake_amount: f64,
    #[serde(default)]
    pub open_rate: f64,
    #[serde(default)]
    pub leverage: f64,
    #[serde(default)]
    pub is_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerBalance {
    #[serde(default)]
    pub available: f64,
    #[serde(default)]
    pub total: f64,
}

/// Downstream execution broker RPCs.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a position; returns the broker-assigned trade id.
    async fn force_enter(&self, req: &ForceEnterRequest) -> Result<i64, BrokerError>;

    /// Closes all (or `amount` of) a position at market.
    async fn force_exit(&self, trade_id: i64, amount: Option<f64>) -> Result<(), BrokerError>;

    async fn list_trades(&self) -> Result<Vec<BrokerTrade>, BrokerError>;

    async fn get_trade(&self, trade_id: i64) -> Result<BrokerTrade, BrokerError>;

    async fn get_balance(&self) -> Result<BrokerBalance, BrokerError>;
}

/// Operator notification channel. Non-critical: failures are logged, never
/// propagated into trading decisions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;
}

/// A notifier that drops everything, for tests and headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_text(&self, _text: &str) -> Result<()> {
        Ok(())
    }
}
