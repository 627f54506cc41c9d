use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV bar as delivered by the venue.
///
/// A candle is immutable once its `close_time_ms` lies in the past; the
/// streaming tail candle (not yet final) may be replaced by a newer snapshot
/// of the same `open_time_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: i64,
    #[serde(default)]
    pub taker_buy_volume: f64,
    #[serde(default)]
    pub taker_sell_volume: f64,
    /// Whether the venue has closed this bar.
    #[serde(default)]
    pub is_final: bool,
}

impl Candle {
    /// Best-effort timestamp for the bar: close time, falling back to open time.
    #[must_use]
    pub const fn timestamp_ms(&self) -> i64 {
        if self.close_time_ms > 0 {
            self.close_time_ms
        } else {
            self.open_time_ms
        }
    }
}

/// A candle scoped to the (symbol, interval) stream it arrived on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub symbol: String,
    pub interval: String,
    pub candle: Candle,
}

/// A single aggregated trade from the venue's trade stream.
///
/// Carries no position identity; consumers key by symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub event_time_ms: i64,
    pub trade_time_ms: i64,
}

impl TradeTick {
    /// Event time, falling back to trade time when the venue omits it.
    #[must_use]
    pub const fn timestamp_ms(&self) -> i64 {
        if self.event_time_ms > 0 {
            self.event_time_ms
        } else {
            self.trade_time_ms
        }
    }
}

/// The freshest known price view for one symbol.
///
/// `last` is the authoritative price for exit evaluation; `high`/`low` carry
/// the latest bar's extremes for intrabar reasoning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceQuote {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last <= 0.0 && self.high <= 0.0 && self.low <= 0.0
    }
}

/// Invoked whenever the underlying connection is (re)established.
pub type ConnectHook = std::sync::Arc<dyn Fn() + Send + Sync>;
/// Invoked with the error text whenever the connection drops.
pub type DisconnectHook = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

/// Options controlling a live subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Streams per SUBSCRIBE frame; 0 means the source default.
    pub batch_size: usize,
    /// Event channel capacity; 0 means the source default.
    pub buffer: usize,
    pub on_connect: Option<ConnectHook>,
    pub on_disconnect: Option<DisconnectHook>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("batch_size", &self.batch_size)
            .field("buffer", &self.buffer)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Running counters for a market source connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub reconnects: u64,
    pub subscribe_errors: u64,
    pub dropped_frames: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_timestamp_prefers_close_time() {
        let c = Candle {
            open_time_ms: 1_000,
            close_time_ms: 59_999,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            trades: 3,
            taker_buy_volume: 6.0,
            taker_sell_volume: 4.0,
            is_final: true,
        };
        assert_eq!(c.timestamp_ms(), 59_999);
    }

    #[test]
    fn tick_timestamp_falls_back_to_trade_time() {
        let t = TradeTick {
            symbol: "ETHUSDT".into(),
            price: 2840.0,
            quantity: 0.5,
            event_time_ms: 0,
            trade_time_ms: 123,
        };
        assert_eq!(t.timestamp_ms(), 123);
    }

    #[test]
    fn empty_quote_detected() {
        assert!(PriceQuote::default().is_empty());
        let q = PriceQuote {
            last: 1.0,
            ..PriceQuote::default()
        };
        assert!(!q.is_empty());
    }
}
