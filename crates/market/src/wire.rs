//! Venue wire formats: REST kline rows and websocket payloads.

use helmsman_core::{Candle, TradeTick};
use serde::Deserialize;

/// The venue encodes most numerics as JSON strings but occasionally as raw
/// numbers; accept both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StrNum {
    Num(f64),
    Text(String),
}

impl StrNum {
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Num(v) => *v,
            Self::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }
}

impl Default for StrNum {
    fn default() -> Self {
        Self::Num(0.0)
    }
}

/// Kline event as delivered inside a combined-streams frame.
#[derive(Debug, Deserialize)]
pub struct KlineFrame {
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i", default)]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: StrNum,
    #[serde(rename = "c")]
    pub close: StrNum,
    #[serde(rename = "h")]
    pub high: StrNum,
    #[serde(rename = "l")]
    pub low: StrNum,
    #[serde(rename = "v")]
    pub volume: StrNum,
    #[serde(rename = "n", default)]
    pub trades: i64,
    #[serde(rename = "x", default)]
    pub is_final: bool,
    #[serde(rename = "V", default)]
    pub taker_buy_volume: StrNum,
}

impl KlineFrame {
    #[must_use]
    pub fn to_candle(&self) -> Candle {
        let volume = self.kline.volume.as_f64();
        let taker_buy = self.kline.taker_buy_volume.as_f64();
        Candle {
            open_time_ms: self.kline.start_time,
            close_time_ms: self.kline.close_time,
            open: self.kline.open.as_f64(),
            high: self.kline.high.as_f64(),
            low: self.kline.low.as_f64(),
            close: self.kline.close.as_f64(),
            volume,
            trades: self.kline.trades,
            taker_buy_volume: taker_buy,
            taker_sell_volume: (volume - taker_buy).max(0.0),
            is_final: self.kline.is_final,
        }
    }
}

/// Aggregated-trade event as delivered inside a combined-streams frame.
#[derive(Debug, Deserialize)]
pub struct AggTradeFrame {
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s", default)]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: StrNum,
    #[serde(rename = "q", default)]
    pub quantity: StrNum,
    #[serde(rename = "T", default)]
    pub trade_time: i64,
}

impl AggTradeFrame {
    #[must_use]
    pub fn to_tick(&self) -> TradeTick {
        TradeTick {
            symbol: self.symbol.to_uppercase(),
            price: self.price.as_f64(),
            quantity: self.quantity.as_f64(),
            event_time_ms: self.event_time,
            trade_time_ms: self.trade_time,
        }
    }
}

/// Decodes one row of the REST klines array:
/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
///   trades, taker_buy_base, taker_buy_quote, ignore]`.
///
/// Rows shorter than 7 fields are rejected.
#[must_use]
pub fn candle_from_rest_row(row: &[serde_json::Value]) -> Option<Candle> {
    if row.len() < 7 {
        return None;
    }
    let volume = value_f64(&row[5]);
    let taker_buy = row.get(9).map(value_f64).unwrap_or_default();
    Some(Candle {
        open_time_ms: value_i64(&row[0]),
        close_time_ms: value_i64(&row[6]),
        open: value_f64(&row[1]),
        high: value_f64(&row[2]),
        low: value_f64(&row[3]),
        close: value_f64(&row[4]),
        volume,
        trades: row.get(8).map(value_i64).unwrap_or_default(),
        taker_buy_volume: taker_buy,
        taker_sell_volume: (volume - taker_buy).max(0.0),
        is_final: true,
    })
}

fn value_f64(v: &serde_json::Value) -> f64 {
    match v {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn value_i64(v: &serde_json::Value) -> i64 {
    match v {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or_else(|| {
            n.as_f64().map(|f| f as i64).unwrap_or(0)
        }),
        serde_json::Value::String(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_frame_decodes_string_or_number_prices() {
        let text = r#"{
            "e": "kline", "E": 1700000000123, "s": "ETHUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "s": "ETHUSDT", "i": "1m",
                "o": "2840.10", "c": 2841.5, "h": "2842.00", "l": "2839.90",
                "v": "120.5", "n": 321, "x": false,
                "q": "342000.0", "V": "70.25", "Q": "199000.0", "B": "0"
            }
        }"#;
        let frame: KlineFrame = serde_json::from_str(text).unwrap();
        let candle = frame.to_candle();
        assert_eq!(candle.open, 2840.10);
        assert_eq!(candle.close, 2841.5);
        assert_eq!(candle.trades, 321);
        assert!(!candle.is_final);
        assert!((candle.taker_sell_volume - 50.25).abs() < 1e-9);
    }

    #[test]
    fn agg_trade_frame_decodes() {
        let text = r#"{
            "e": "aggTrade", "E": 1700000000500, "s": "ethusdt",
            "a": 1, "p": "2840.55", "q": "0.75", "f": 1, "l": 2,
            "T": 1700000000498, "m": true
        }"#;
        let frame: AggTradeFrame = serde_json::from_str(text).unwrap();
        let tick = frame.to_tick();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert_eq!(tick.price, 2840.55);
        assert_eq!(tick.event_time_ms, 1_700_000_000_500);
        assert_eq!(tick.trade_time_ms, 1_700_000_000_498);
    }

    #[test]
    fn rest_row_decodes_and_rejects_short_rows() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000, "2840.1", "2842.0", "2839.9", "2841.5",
                "120.5", 1700000059999, "342000.0", 321, "70.25", "199000.0", "0"]"#,
        )
        .unwrap();
        let candle = candle_from_rest_row(&row).unwrap();
        assert_eq!(candle.open_time_ms, 1_700_000_000_000);
        assert_eq!(candle.close_time_ms, 1_700_000_059_999);
        assert_eq!(candle.trades, 321);

        let short: Vec<serde_json::Value> = serde_json::from_str("[1, 2, 3]").unwrap();
        assert!(candle_from_rest_row(&short).is_none());
    }
}
