//! Fan-in of live market events: candles into the ring, trade ticks into the
//! freshest-price view, price updates out to observers.

use crate::ring::CandleRing;
use anyhow::Result;
use chrono::{TimeZone, Utc};
use helmsman_core::{
    CandleEvent, MarketSource, MonitorConfig, Notifier, PriceQuote, SourceStats, SubscribeOptions,
    TradeTick,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A fresh price pushed to observers on every trade tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub quote: PriceQuote,
}

#[derive(Debug, Clone, Copy)]
struct LastPrice {
    price: f64,
    ts_ms: i64,
}

#[derive(Debug, Clone, Default)]
struct CachedQuote {
    quote: PriceQuote,
    ts_ms: i64,
}

/// Maintains the freshest trade price and a candle-derived quote cache per
/// symbol, feeds the candle ring, and publishes price updates to observers.
///
/// Ownership is one-way: the monitor pushes onto observer channels and holds
/// no references back into its consumers.
pub struct PriceMonitor {
    source: Arc<dyn MarketSource>,
    ring: Arc<CandleRing>,
    notifier: Arc<dyn Notifier>,
    symbols: Vec<String>,
    intervals: Vec<String>,
    last_price_max_age: Duration,
    candle_fallback_max_age: Duration,
    last_price: RwLock<HashMap<String, LastPrice>>,
    price_cache: RwLock<HashMap<String, CachedQuote>>,
    observers: Mutex<Vec<mpsc::Sender<PriceUpdate>>>,
    announced: AtomicBool,
    trade_stream_up: AtomicBool,
}

impl PriceMonitor {
    #[must_use]
    pub fn new(
        source: Arc<dyn MarketSource>,
        ring: Arc<CandleRing>,
        notifier: Arc<dyn Notifier>,
        cfg: &MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            ring,
            notifier,
            symbols: cfg.symbols.clone(),
            intervals: cfg.intervals.clone(),
            last_price_max_age: Duration::from_secs(cfg.last_price_max_age_secs),
            candle_fallback_max_age: Duration::from_secs(cfg.candle_fallback_max_age_secs),
            last_price: RwLock::new(HashMap::new()),
            price_cache: RwLock::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            announced: AtomicBool::new(false),
            trade_stream_up: AtomicBool::new(false),
        })
    }

    /// Registers an observer. Delivery is best-effort: a full channel drops
    /// updates rather than blocking the trade loop.
    pub fn subscribe_prices(&self, buffer: usize) -> mpsc::Receiver<PriceUpdate> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.observers.lock().push(tx);
        rx
    }

    /// Starts the candle and trade consumption loops.
    ///
    /// # Errors
    /// Returns an error when either initial subscription fails.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let monitor = Arc::clone(&self);
        let notifier = Arc::clone(&self.notifier);
        let opts = SubscribeOptions {
            on_connect: Some(Arc::new({
                let monitor = Arc::clone(&self);
                move || monitor.announce_connected()
            })),
            on_disconnect: Some(Arc::new({
                let notifier = Arc::clone(&notifier);
                move |err: &str| {
                    tracing::error!(error = %err, "candle stream disconnected");
                    let notifier = Arc::clone(&notifier);
                    let text = format!("Candle stream disconnected: {err}");
                    tokio::spawn(async move {
                        if let Err(e) = notifier.send_text(&text).await {
                            tracing::warn!(error = %e, "notify failed");
                        }
                    });
                }
            })),
            ..SubscribeOptions::default()
        };
        let mut candles = self
            .source
            .subscribe(&self.symbols, &self.intervals, opts)
            .await?;
        tokio::spawn(async move {
            while let Some(event) = candles.recv().await {
                monitor.on_candle_event(&event);
            }
            tracing::info!("candle stream closed");
        });

        let monitor = Arc::clone(&self);
        let trade_opts = SubscribeOptions {
            on_connect: Some(Arc::new({
                let monitor = Arc::clone(&self);
                move || monitor.announce_trade_stream()
            })),
            on_disconnect: Some(Arc::new({
                let monitor = Arc::clone(&self);
                move |err: &str| {
                    monitor.trade_stream_up.store(false, Ordering::Relaxed);
                    tracing::warn!(error = %err, "trade stream disconnected");
                }
            })),
            ..SubscribeOptions::default()
        };
        let mut ticks = self.source.subscribe_trades(&self.symbols, trade_opts).await?;
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                monitor.handle_trade(&tick);
            }
            tracing::info!("trade stream closed");
        });
        Ok(())
    }

    fn announce_connected(&self) {
        if self.announced.swap(true, Ordering::Relaxed) {
            return;
        }
        let text = format!(
            "Market stream connected: {} symbols x {} intervals",
            self.symbols.len(),
            self.intervals.len()
        );
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.send_text(&text).await {
                tracing::warn!(error = %e, "notify failed");
            }
        });
    }

    fn announce_trade_stream(&self) {
        let was_up = self.trade_stream_up.swap(true, Ordering::Relaxed);
        let text = if was_up {
            "Trade price stream recovered"
        } else {
            "Trade price stream established"
        };
        let notifier = Arc::clone(&self.notifier);
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_text(&text).await {
                tracing::warn!(error = %e, "notify failed");
            }
        });
    }

    /// Writes the candle into the ring and refreshes the quote cache with
    /// the bar's extremes.
    pub fn on_candle_event(&self, event: &CandleEvent) {
        let symbol = event.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return;
        }
        let c = event.candle;
        if let Err(e) = self.ring.put(&symbol, &event.interval, &[c]) {
            tracing::warn!(error = %e, "candle ring rejected event");
            return;
        }
        if c.close <= 0.0 && c.high <= 0.0 && c.low <= 0.0 {
            return;
        }
        let ts = c.timestamp_ms();
        let quote = PriceQuote {
            symbol: symbol.clone(),
            last: c.close,
            high: c.high,
            low: c.low,
            updated_at: Utc.timestamp_millis_opt(ts).single(),
        };
        self.price_cache
            .write()
            .insert(symbol, CachedQuote { quote, ts_ms: ts });
    }

    /// Records the freshest trade price and publishes a merged quote to
    /// every observer.
    pub fn handle_trade(&self, tick: &TradeTick) {
        if tick.price <= 0.0 {
            return;
        }
        let symbol = tick.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return;
        }
        let mut ts = tick.timestamp_ms();
        if ts == 0 {
            ts = Utc::now().timestamp_millis();
        }
        self.last_price.write().insert(
            symbol.clone(),
            LastPrice {
                price: tick.price,
                ts_ms: ts,
            },
        );
        // The candle cache keeps its own timestamps; the fresh trade price
        // is merged in at read time so stale ticks can never mask how old
        // the underlying bar is.
        let quote = self.latest_quote(&symbol);
        let update = PriceUpdate { symbol, quote };
        let mut observers = self.observers.lock();
        observers.retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(symbol = %update.symbol, "observer full, price update dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn fresh_last_price(&self, symbol: &str) -> Option<f64> {
        let entry = *self.last_price.read().get(symbol)?;
        if entry.price <= 0.0 {
            return None;
        }
        if entry.ts_ms > 0 {
            let age_ms = Utc::now().timestamp_millis() - entry.ts_ms;
            if age_ms > self.last_price_max_age.as_millis() as i64 {
                return None;
            }
        }
        Some(entry.price)
    }

    /// The freshest authoritative price, or zero when nothing recent enough
    /// exists. Callers must treat zero as "no price".
    #[must_use]
    pub fn latest_price(&self, symbol: &str) -> f64 {
        let symbol = symbol.trim().to_uppercase();
        if let Some(price) = self.fresh_last_price(&symbol) {
            return price;
        }
        self.latest_quote(&symbol).last
    }

    /// Merged quote: latest bar extremes plus the fresh trade price when one
    /// exists. Candle-derived data older than the fallback age yields an
    /// empty quote so exit logic refuses to act on it.
    #[must_use]
    pub fn latest_quote(&self, symbol: &str) -> PriceQuote {
        let symbol = symbol.trim().to_uppercase();
        let fresh = self.fresh_last_price(&symbol);
        let now_ms = Utc::now().timestamp_millis();
        let max_age_ms = self.candle_fallback_max_age.as_millis() as i64;

        let cached = self.price_cache.read().get(&symbol).cloned();
        if let Some(entry) = cached {
            if !entry.quote.is_empty() && entry.ts_ms > 0 && now_ms - entry.ts_ms <= max_age_ms {
                let mut quote = entry.quote;
                if let Some(price) = fresh {
                    quote.last = price;
                }
                return quote;
            }
        }

        // Cache miss or stale cache: fall back to the ring's newest candle.
        // A fresh trade price alone still quotes, just without bar extremes.
        let trade_only = |symbol: String| {
            fresh.map_or_else(PriceQuote::default, |price| PriceQuote {
                symbol,
                last: price,
                high: 0.0,
                low: 0.0,
                updated_at: None,
            })
        };
        let interval = self
            .intervals
            .first()
            .map_or_else(|| "1m".to_string(), Clone::clone);
        let candles = self.ring.export(&symbol, &interval, 1);
        let Some(last) = candles.last() else {
            return trade_only(symbol);
        };
        let ts = last.timestamp_ms();
        if ts > 0 && now_ms - ts > max_age_ms {
            tracing::warn!(
                %symbol,
                %interval,
                age_secs = (now_ms - ts) / 1000,
                "price fallback data stale, refusing to quote"
            );
            return trade_only(symbol);
        }
        let mut quote = PriceQuote {
            symbol,
            last: last.close,
            high: last.high,
            low: last.low,
            updated_at: Utc.timestamp_millis_opt(ts).single(),
        };
        if let Some(price) = fresh {
            quote.last = price;
        }
        quote
    }

    #[must_use]
    pub fn stats(&self) -> SourceStats {
        self.source.stats()
    }

    pub async fn close(&self) {
        self.source.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplaySource;
    use helmsman_core::{Candle, NullNotifier};

    fn monitor_with(cfg: MonitorConfig) -> Arc<PriceMonitor> {
        let source = Arc::new(ReplaySource::default());
        let ring = Arc::new(CandleRing::new(100));
        PriceMonitor::new(source, ring, Arc::new(NullNotifier), &cfg)
    }

    fn cfg() -> MonitorConfig {
        MonitorConfig {
            symbols: vec!["ETHUSDT".to_string()],
            intervals: vec!["1m".to_string()],
            ring_capacity: 100,
            last_price_max_age_secs: 10,
            candle_fallback_max_age_secs: 30,
        }
    }

    fn candle_event(ts_ms: i64) -> CandleEvent {
        CandleEvent {
            symbol: "ETHUSDT".to_string(),
            interval: "1m".to_string(),
            candle: Candle {
                open_time_ms: ts_ms - 59_999,
                close_time_ms: ts_ms,
                open: 2840.0,
                high: 2845.0,
                low: 2838.0,
                close: 2842.0,
                volume: 10.0,
                trades: 5,
                taker_buy_volume: 6.0,
                taker_sell_volume: 4.0,
                is_final: false,
            },
        }
    }

    fn tick(price: f64, ts_ms: i64) -> TradeTick {
        TradeTick {
            symbol: "ETHUSDT".to_string(),
            price,
            quantity: 0.5,
            event_time_ms: ts_ms,
            trade_time_ms: ts_ms,
        }
    }

    #[tokio::test]
    async fn fresh_trade_price_wins() {
        let monitor = monitor_with(cfg());
        let now = Utc::now().timestamp_millis();
        monitor.on_candle_event(&candle_event(now));
        monitor.handle_trade(&tick(2843.5, now));
        assert_eq!(monitor.latest_price("ETHUSDT"), 2843.5);
        let quote = monitor.latest_quote("ETHUSDT");
        assert_eq!(quote.last, 2843.5);
        assert_eq!(quote.high, 2845.0);
        assert_eq!(quote.low, 2838.0);
    }

    #[tokio::test]
    async fn stale_trade_price_falls_back_to_recent_candle() {
        let monitor = monitor_with(cfg());
        let now = Utc::now().timestamp_millis();
        monitor.on_candle_event(&candle_event(now - 5_000));
        monitor.handle_trade(&tick(2843.5, now - 20_000));
        // Trade price is 20s old (limit 10s); the 5s-old candle close wins.
        assert_eq!(monitor.latest_price("ETHUSDT"), 2842.0);
    }

    #[tokio::test]
    async fn everything_stale_returns_no_price() {
        let monitor = monitor_with(cfg());
        let now = Utc::now().timestamp_millis();
        monitor.on_candle_event(&candle_event(now - 60_000));
        monitor.handle_trade(&tick(2843.5, now - 20_000));
        assert_eq!(monitor.latest_price("ETHUSDT"), 0.0);
        assert!(monitor.latest_quote("ETHUSDT").is_empty());
    }

    #[tokio::test]
    async fn unknown_symbol_returns_no_price() {
        let monitor = monitor_with(cfg());
        assert_eq!(monitor.latest_price("BTCUSDT"), 0.0);
    }

    #[tokio::test]
    async fn fresh_trade_without_candles_still_quotes() {
        let monitor = monitor_with(cfg());
        let now = Utc::now().timestamp_millis();
        monitor.handle_trade(&tick(2843.5, now));
        let quote = monitor.latest_quote("ETHUSDT");
        assert_eq!(quote.last, 2843.5);
        assert_eq!(quote.high, 0.0);
        assert_eq!(monitor.latest_price("ETHUSDT"), 2843.5);
    }

    #[tokio::test]
    async fn observers_receive_merged_quotes() {
        let monitor = monitor_with(cfg());
        let mut prices = monitor.subscribe_prices(8);
        let now = Utc::now().timestamp_millis();
        monitor.on_candle_event(&candle_event(now));
        monitor.handle_trade(&tick(2844.0, now));
        let update = prices.try_recv().unwrap();
        assert_eq!(update.symbol, "ETHUSDT");
        assert_eq!(update.quote.last, 2844.0);
        assert_eq!(update.quote.high, 2845.0);
    }

    #[tokio::test]
    async fn zero_price_ticks_are_ignored() {
        let monitor = monitor_with(cfg());
        let mut prices = monitor.subscribe_prices(8);
        monitor.handle_trade(&tick(0.0, Utc::now().timestamp_millis()));
        assert!(prices.try_recv().is_err());
    }
}
