//! Interval-aligned indicator scheduling.
//!
//! One task per (symbol, interval) wakes just after each bar boundary,
//! recomputes the indicator window, feeds fresh divergence signals into the
//! validator and advances pending validations by the newly closed bar.

use chrono::Utc;
use helmsman_core::{Candle, IndicatorConfig};
use helmsman_market::CandleRing;
use helmsman_signals::{
    build_snapshot, compute_atr_series, compute_report, compute_signals, DivergenceScorer,
    DivergenceValidator, WtMfiSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Parses venue interval notation (`1m`, `15m`, `1h`, `4h`, `1d`).
#[must_use]
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let interval = interval.trim().to_lowercase();
    let (digits, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Milliseconds until just past the next bar boundary.
fn until_next_boundary(interval: Duration, now_ms: i64) -> Duration {
    let step = interval.as_millis() as i64;
    let next = (now_ms / step + 1) * step;
    // A small grace period lets the venue flush the closing bar first.
    Duration::from_millis((next - now_ms).max(0) as u64 + 1500)
}

/// The newest candle that has actually closed, if any.
fn last_closed(candles: &[Candle], now_ms: i64) -> Option<&Candle> {
    candles
        .iter()
        .rev()
        .find(|c| c.is_final || (c.close_time_ms > 0 && c.close_time_ms <= now_ms))
}

pub struct IndicatorSchedule {
    pub symbol: String,
    pub interval: String,
    pub ring: Arc<CandleRing>,
    pub scorer: Arc<DivergenceScorer>,
    pub validator: Arc<DivergenceValidator>,
    pub cfg: IndicatorConfig,
}

/// Runs until the shutdown channel flips. One tick per bar boundary.
pub async fn run_indicator_loop(schedule: IndicatorSchedule, mut shutdown: watch::Receiver<bool>) {
    let Some(step) = parse_interval(&schedule.interval) else {
        tracing::error!(interval = %schedule.interval, "unparseable interval, scheduler not started");
        return;
    };
    loop {
        let wait = until_next_boundary(step, Utc::now().timestamp_millis());
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            () = tokio::time::sleep(wait) => {}
        }
        if *shutdown.borrow() {
            return;
        }
        tick(&schedule);
    }
}

fn tick(schedule: &IndicatorSchedule) {
    let candles = schedule
        .ring
        .export(&schedule.symbol, &schedule.interval, schedule.cfg.window);
    if candles.len() < 30 {
        tracing::debug!(
            symbol = %schedule.symbol,
            interval = %schedule.interval,
            count = candles.len(),
            "window too short, skipping indicator tick"
        );
        return;
    }

    let report = match compute_report(
        &schedule.symbol,
        &schedule.interval,
        &candles,
        &schedule.cfg,
    ) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(symbol = %schedule.symbol, error = %e, "indicator computation failed");
            return;
        }
    };
    match build_snapshot(
        &candles,
        &report,
        WtMfiSettings::from_config(&schedule.cfg),
        schedule.cfg.rsi_enabled,
        &schedule.scorer,
    ) {
        Ok(snapshot) => {
            if let Some(div) = &snapshot.data.divergence_multi {
                tracing::info!(
                    symbol = %schedule.symbol,
                    interval = %schedule.interval,
                    signals = div.total,
                    direction = %div.direction,
                    "indicator snapshot computed"
                );
            }
        }
        Err(e) => tracing::warn!(symbol = %schedule.symbol, error = %e, "snapshot build failed"),
    }

    if let Some(cvd) = helmsman_market::compute_cvd(&candles) {
        tracing::debug!(
            symbol = %schedule.symbol,
            interval = %schedule.interval,
            cvd = cvd.value,
            momentum = cvd.momentum,
            divergence = %cvd.divergence,
            "taker flow computed"
        );
    }

    let signals = compute_signals(&candles, schedule.cfg.rsi_enabled);
    if !signals.is_empty() {
        let price = candles[candles.len() - 1].close;
        let atr = compute_atr_series(&candles, 14)
            .ok()
            .and_then(|s| s.last().copied())
            .unwrap_or(0.0);
        for signal in &signals {
            schedule.validator.register_signal(
                signal,
                &schedule.symbol,
                &schedule.interval,
                price,
                atr,
            );
        }
    }
    if let Some(closed) = last_closed(&candles, Utc::now().timestamp_millis()) {
        schedule
            .validator
            .on_new_candle(&schedule.symbol, &schedule.interval, closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_notation_parses() {
        assert_eq!(parse_interval("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_interval("4H"), Some(Duration::from_secs(14_400)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("xyz"), None);
        assert_eq!(parse_interval("0m"), None);
        assert_eq!(parse_interval(""), None);
    }

    #[test]
    fn boundary_wait_lands_after_the_bar_close() {
        let interval = Duration::from_secs(60);
        // 10s into a minute bar: 50s remain plus the grace period.
        let wait = until_next_boundary(interval, 10_000);
        assert_eq!(wait, Duration::from_millis(51_500));
    }

    #[test]
    fn last_closed_skips_the_streaming_tail() {
        let closed = Candle {
            open_time_ms: 0,
            close_time_ms: 59_999,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            trades: 1,
            taker_buy_volume: 0.5,
            taker_sell_volume: 0.5,
            is_final: true,
        };
        let streaming = Candle {
            open_time_ms: 60_000,
            close_time_ms: 119_999,
            is_final: false,
            ..closed
        };
        let candles = vec![closed, streaming];
        let found = last_closed(&candles, 70_000).unwrap();
        assert_eq!(found.open_time_ms, 0);
    }
}
