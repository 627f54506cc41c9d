//! Canned market source used by tests and offline runs.

use async_trait::async_trait;
use helmsman_core::{
    Candle, CandleEvent, MarketSource, SourceError, SourceStats, SubscribeOptions, TradeTick,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Replays pre-loaded candles and ticks instead of talking to a venue.
///
/// `subscribe`/`subscribe_trades` drain the loaded events once and then
/// close the channel, which is exactly what deterministic tests want.
#[derive(Default)]
pub struct ReplaySource {
    history: Mutex<HashMap<String, Vec<Candle>>>,
    candle_events: Mutex<Vec<CandleEvent>>,
    trade_ticks: Mutex<Vec<TradeTick>>,
}

fn key(symbol: &str, interval: &str) -> String {
    format!("{}@{}", symbol.to_uppercase(), interval.to_lowercase())
}

impl ReplaySource {
    pub fn load_history(&self, symbol: &str, interval: &str, candles: Vec<Candle>) {
        self.history.lock().insert(key(symbol, interval), candles);
    }

    pub fn load_candle_events(&self, events: Vec<CandleEvent>) {
        self.candle_events.lock().extend(events);
    }

    pub fn load_trade_ticks(&self, ticks: Vec<TradeTick>) {
        self.trade_ticks.lock().extend(ticks);
    }
}

#[async_trait]
impl MarketSource for ReplaySource {
    async fn fetch_history(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        let all = self
            .history
            .lock()
            .get(&key(symbol, interval))
            .cloned()
            .unwrap_or_default();
        let limit = if limit == 0 { all.len() } else { limit };
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn subscribe(
        &self,
        symbols: &[String],
        intervals: &[String],
        opts: SubscribeOptions,
    ) -> Result<mpsc::Receiver<CandleEvent>, SourceError> {
        let wanted: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        let intervals: Vec<String> = intervals.iter().map(|s| s.to_lowercase()).collect();
        let events: Vec<CandleEvent> = self
            .candle_events
            .lock()
            .iter()
            .filter(|e| wanted.contains(&e.symbol) && intervals.contains(&e.interval))
            .cloned()
            .collect();
        let buffer = if opts.buffer == 0 { 512 } else { opts.buffer };
        let (tx, rx) = mpsc::channel(buffer.max(events.len().max(1)));
        if let Some(hook) = opts.on_connect {
            hook();
        }
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn subscribe_trades(
        &self,
        symbols: &[String],
        opts: SubscribeOptions,
    ) -> Result<mpsc::Receiver<TradeTick>, SourceError> {
        let wanted: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
        let ticks: Vec<TradeTick> = self
            .trade_ticks
            .lock()
            .iter()
            .filter(|t| wanted.contains(&t.symbol))
            .cloned()
            .collect();
        let buffer = if opts.buffer == 0 { 512 } else { opts.buffer };
        let (tx, rx) = mpsc::channel(buffer.max(ticks.len().max(1)));
        if let Some(hook) = opts.on_connect {
            hook();
        }
        tokio::spawn(async move {
            for tick in ticks {
                if tx.send(tick).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn stats(&self) -> SourceStats {
        SourceStats::default()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time_ms: i64) -> Candle {
        Candle {
            open_time_ms,
            close_time_ms: open_time_ms + 59_999,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            trades: 1,
            taker_buy_volume: 0.5,
            taker_sell_volume: 0.5,
            is_final: true,
        }
    }

    #[tokio::test]
    async fn history_respects_limit() {
        let source = ReplaySource::default();
        source.load_history("ethusdt", "1M", (0..5).map(|i| candle(i * 60_000)).collect());
        let out = source.fetch_history("ETHUSDT", "1m", 2).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].open_time_ms, 3 * 60_000);
    }

    #[tokio::test]
    async fn subscription_replays_loaded_events_then_closes() {
        let source = ReplaySource::default();
        source.load_candle_events(vec![CandleEvent {
            symbol: "ETHUSDT".to_string(),
            interval: "1m".to_string(),
            candle: candle(0),
        }]);
        let mut rx = source
            .subscribe(
                &["ETHUSDT".to_string()],
                &["1m".to_string()],
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
