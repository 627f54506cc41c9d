//! Process wiring: market source, monitor, engines, exit controller, web.

use crate::scheduler::{self, IndicatorSchedule};
use anyhow::{Context, Result};
use async_trait::async_trait;
use helmsman_broker::HttpBroker;
use helmsman_core::{AppConfig, MarketSource, Notifier, PositionStore};
use helmsman_data::PgPositionStore;
use helmsman_exit::ExitController;
use helmsman_market::{CandleRing, PriceMonitor, VenueSource};
use helmsman_signals::{DivergenceScorer, DivergenceValidator};
use helmsman_web::{serve, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How often the stale-price sweep re-evaluates symbols with open positions.
const SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// Fallback notifier writing operator messages to the log stream.
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_text(&self, text: &str) -> Result<()> {
        tracing::info!(target: "notify", "{text}");
        Ok(())
    }
}

pub async fn run(config: AppConfig) -> Result<()> {
    let store: Arc<dyn PositionStore> = Arc::new(
        PgPositionStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("position store connect failed")?,
    );
    let broker = Arc::new(HttpBroker::new(config.broker.clone())?);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let source: Arc<dyn MarketSource> = Arc::new(VenueSource::new(config.venue.clone())?);
    let ring = Arc::new(CandleRing::new(config.monitor.ring_capacity));

    warm_up(&*source, &ring, &config).await;

    let monitor = PriceMonitor::new(
        Arc::clone(&source),
        Arc::clone(&ring),
        Arc::clone(&notifier),
        &config.monitor,
    );
    Arc::clone(&monitor)
        .start()
        .await
        .context("market streams failed")?;

    let controller = ExitController::new(
        Arc::clone(&store),
        broker,
        Arc::clone(&notifier),
        config.exits.clone(),
    );
    controller.refresh_cache().await?;

    // Exit controller consumes the monitor's price channel.
    let mut prices = monitor.subscribe_prices(1024);
    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            while let Some(update) = prices.recv().await {
                controller.on_price_tick(&update.symbol, &update.quote).await;
            }
            tracing::info!("price channel closed");
        });
    }

    // Periodic sweep drives staleness detection for symbols whose trade
    // stream has gone quiet.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let controller = Arc::clone(&controller);
        let monitor = Arc::clone(&monitor);
        let symbols = config.monitor.symbols.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    () = tokio::time::sleep(SWEEP_PERIOD) => {}
                }
                for symbol in &symbols {
                    let quote = monitor.latest_quote(symbol);
                    controller.on_price_tick(symbol, &quote).await;
                }
            }
        });
    }

    // Indicator scheduling per (symbol, interval).
    let scorer = Arc::new(DivergenceScorer::new());
    let validator = Arc::new(DivergenceValidator::new(Arc::clone(&scorer)));
    for symbol in &config.monitor.symbols {
        for interval in &config.monitor.intervals {
            let schedule = IndicatorSchedule {
                symbol: symbol.clone(),
                interval: interval.clone(),
                ring: Arc::clone(&ring),
                scorer: Arc::clone(&scorer),
                validator: Arc::clone(&validator),
                cfg: config.indicators.clone(),
            };
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                scheduler::run_indicator_loop(schedule, shutdown).await;
            });
        }
    }

    // Webhook + health endpoints.
    let state = AppState {
        controller: Arc::clone(&controller),
        monitor: Some(Arc::clone(&monitor)),
    };
    let server_cfg = config.server.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = serve(&server_cfg, state).await {
            tracing::error!(error = %e, "webhook server exited");
        }
    });

    tokio::signal::ctrl_c().await.context("signal listener")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    monitor.close().await;
    server.abort();
    Ok(())
}

/// Seeds the candle ring with recent history so indicator windows are full
/// from the first tick.
async fn warm_up(source: &dyn MarketSource, ring: &CandleRing, config: &AppConfig) {
    for symbol in &config.monitor.symbols {
        for interval in &config.monitor.intervals {
            match source
                .fetch_history(symbol, interval, config.venue.history_limit)
                .await
            {
                Ok(candles) if !candles.is_empty() => {
                    let count = candles.len();
                    if let Err(e) = ring.set(symbol, interval, candles) {
                        tracing::warn!(%symbol, %interval, error = %e, "ring seed failed");
                    } else {
                        tracing::debug!(%symbol, %interval, count, "history warm-up loaded");
                    }
                }
                Ok(_) => tracing::warn!(%symbol, %interval, "empty history on warm-up"),
                Err(e) => {
                    // The websocket stream will backfill eventually; a missed
                    // warm-up only delays the first indicator tick.
                    tracing::warn!(%symbol, %interval, error = %e, "history warm-up failed");
                }
            }
        }
    }
}
