//! Venue-facing implementation of [`MarketSource`]: REST history plus live
//! combined-streams subscriptions.

use crate::stream::CombinedStreamsClient;
use crate::wire::{self, AggTradeFrame, KlineFrame};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use helmsman_core::{
    Candle, CandleEvent, MarketSource, SourceError, SourceStats, SubscribeOptions, TradeTick,
    VenueConfig,
};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_HISTORY_LIMIT: usize = 1500;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const DEFAULT_EVENT_BUFFER: usize = 512;
const DEFAULT_TRADE_BUFFER: usize = 2048;
const SUBSCRIBER_BUFFER: usize = 200;

pub struct VenueSource {
    cfg: VenueConfig,
    http: reqwest::Client,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    kline_ws: Mutex<Option<Arc<CombinedStreamsClient>>>,
    trade_ws: Mutex<Option<Arc<CombinedStreamsClient>>>,
}

impl VenueSource {
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(cfg: VenueConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        Ok(Self {
            cfg,
            http,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(nonzero!(10u32)))),
            kline_ws: Mutex::new(None),
            trade_ws: Mutex::new(None),
        })
    }

    async fn open_client(
        &self,
        slot: &Mutex<Option<Arc<CombinedStreamsClient>>>,
        opts: &SubscribeOptions,
    ) -> Result<Arc<CombinedStreamsClient>, SourceError> {
        let batch = if opts.batch_size == 0 {
            self.cfg.ws_batch_size
        } else {
            opts.batch_size
        };
        let client = CombinedStreamsClient::new(&self.cfg.ws_url, batch);
        client.set_hooks(opts.on_connect.clone(), opts.on_disconnect.clone());
        Arc::clone(&client).connect().await?;
        // A fresh subscription replaces any previous one on this slot.
        let previous = slot.lock().replace(Arc::clone(&client));
        if let Some(old) = previous {
            old.close().await;
        }
        Ok(client)
    }
}

#[async_trait]
impl MarketSource for VenueSource {
    async fn fetch_history(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError> {
        let symbol = symbol.trim().to_uppercase();
        let interval = interval.trim().to_lowercase();
        if symbol.is_empty() {
            return Err(SourceError::Decode("symbol is required".to_string()));
        }
        if interval.is_empty() {
            return Err(SourceError::Decode("interval is required".to_string()));
        }
        let limit = if limit == 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            limit.min(MAX_HISTORY_LIMIT)
        };

        self.rate_limiter.until_ready().await;
        let url = format!(
            "{}/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}",
            self.cfg.rest_url
        );
        tracing::debug!(%url, "fetching kline history");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Transport(anyhow::anyhow!(e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(rows
            .iter()
            .filter_map(|row| wire::candle_from_rest_row(row))
            .collect())
    }

    async fn subscribe(
        &self,
        symbols: &[String],
        intervals: &[String],
        opts: SubscribeOptions,
    ) -> Result<mpsc::Receiver<CandleEvent>, SourceError> {
        if symbols.is_empty() || intervals.is_empty() {
            return Err(SourceError::Subscribe(
                "symbols and intervals are required".to_string(),
            ));
        }
        let client = self.open_client(&self.kline_ws, &opts).await?;
        let buffer = if opts.buffer == 0 {
            DEFAULT_EVENT_BUFFER
        } else {
            opts.buffer
        };
        let (out, rx) = mpsc::channel(buffer);

        let intervals: Vec<String> = intervals
            .iter()
            .map(|iv| iv.trim().to_lowercase())
            .filter(|iv| !iv.is_empty())
            .collect();
        let mut streams = Vec::new();
        for symbol in symbols {
            let upper = symbol.trim().to_uppercase();
            if upper.is_empty() {
                continue;
            }
            for interval in &intervals {
                let stream = format!("{}@kline_{interval}", upper.to_lowercase());
                let mut sub = client.add_subscriber(&stream, SUBSCRIBER_BUFFER);
                let out = out.clone();
                let (symbol, interval) = (upper.clone(), interval.clone());
                tokio::spawn(async move {
                    while let Some(payload) = sub.recv().await {
                        let frame: KlineFrame = match serde_json::from_value(payload) {
                            Ok(f) => f,
                            Err(e) => {
                                tracing::warn!(error = %e, "undecodable kline frame");
                                continue;
                            }
                        };
                        let event = CandleEvent {
                            symbol: symbol.clone(),
                            interval: interval.clone(),
                            candle: frame.to_candle(),
                        };
                        if out.try_send(event).is_err() {
                            tracing::warn!(%symbol, %interval, "event channel full, candle dropped");
                        }
                    }
                });
                streams.push(stream);
            }
        }
        client.batch_subscribe(&streams).await?;
        Ok(rx)
    }

    async fn subscribe_trades(
        &self,
        symbols: &[String],
        opts: SubscribeOptions,
    ) -> Result<mpsc::Receiver<TradeTick>, SourceError> {
        if symbols.is_empty() {
            return Err(SourceError::Subscribe("symbols are required".to_string()));
        }
        let client = self.open_client(&self.trade_ws, &opts).await?;
        let buffer = if opts.buffer == 0 {
            DEFAULT_TRADE_BUFFER
        } else {
            opts.buffer
        };
        let (out, rx) = mpsc::channel(buffer);

        let mut streams = Vec::new();
        for symbol in symbols {
            let upper = symbol.trim().to_uppercase();
            if upper.is_empty() {
                continue;
            }
            let stream = format!("{}@aggTrade", upper.to_lowercase());
            let mut sub = client.add_subscriber(&stream, SUBSCRIBER_BUFFER);
            let out = out.clone();
            tokio::spawn(async move {
                while let Some(payload) = sub.recv().await {
                    let frame: AggTradeFrame = match serde_json::from_value(payload) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable trade frame");
                            continue;
                        }
                    };
                    if out.try_send(frame.to_tick()).is_err() {
                        tracing::warn!("trade channel full, tick dropped");
                    }
                }
            });
            streams.push(stream);
        }
        client.batch_subscribe(&streams).await?;
        Ok(rx)
    }

    fn stats(&self) -> SourceStats {
        let mut total = SourceStats::default();
        for slot in [&self.kline_ws, &self.trade_ws] {
            if let Some(client) = slot.lock().as_ref() {
                let s = client.stats();
                total.reconnects += s.reconnects;
                total.subscribe_errors += s.subscribe_errors;
                total.dropped_frames += s.dropped_frames;
                if s.last_error.is_some() {
                    total.last_error = s.last_error;
                }
            }
        }
        total
    }

    async fn close(&self) {
        let kline = self.kline_ws.lock().take();
        if let Some(client) = kline {
            client.close().await;
        }
        let trade = self.trade_ws.lock().take();
        if let Some(client) = trade {
            client.close().await;
        }
    }
}
