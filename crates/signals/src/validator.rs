//! Forward validation of divergence signals.
//!
//! Each registered signal gets a price target derived from ATR and a
//! timeframe-sized bar window. Subsequent closes track the extremes; when
//! the window elapses the outcome is finalized into the scorer's record set.

use crate::divergence::DivergenceSignal;
use crate::scoring::{DivergenceRecord, DivergenceScorer};
use chrono::Utc;
use helmsman_core::Candle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const ATR_MULTIPLIER: f64 = 1.5;
const DEFAULT_WINDOW_BARS: usize = 12;
/// Recompute weights every this many validated records.
const WEIGHT_UPDATE_EVERY: usize = 10;

fn window_bars(timeframe: &str) -> usize {
    match timeframe {
        "15m" => 20,
        "1h" => 12,
        "4h" => 8,
        _ => DEFAULT_WINDOW_BARS,
    }
}

/// A signal awaiting its validation window.
#[derive(Debug, Clone)]
pub struct PendingValidation {
    pub record: DivergenceRecord,
    pub target_price: f64,
    pub window_bars: usize,
    pub bars_elapsed: usize,
    pub highest_seen: f64,
    pub lowest_seen: f64,
}

pub struct DivergenceValidator {
    pending: Mutex<HashMap<String, Vec<PendingValidation>>>,
    scorer: Arc<DivergenceScorer>,
}

fn key(symbol: &str, timeframe: &str) -> String {
    format!("{symbol}_{timeframe}")
}

impl DivergenceValidator {
    #[must_use]
    pub fn new(scorer: Arc<DivergenceScorer>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            scorer,
        }
    }

    /// Registers a fresh signal. Bullish signals target `price + 1.5 ATR`,
    /// bearish ones `price - 1.5 ATR`.
    pub fn register_signal(
        &self,
        signal: &DivergenceSignal,
        symbol: &str,
        timeframe: &str,
        price: f64,
        atr: f64,
    ) {
        if price <= 0.0 {
            tracing::warn!(%symbol, "refusing to register validation without a price");
            return;
        }
        let bullish = signal.kind.is_bullish();
        let target_price = if bullish {
            price * (1.0 + atr * ATR_MULTIPLIER / price)
        } else {
            price * (1.0 - atr * ATR_MULTIPLIER / price)
        };
        let pending = PendingValidation {
            record: DivergenceRecord {
                timestamp: Utc::now(),
                indicator: signal.indicator.clone(),
                kind: signal.kind,
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
                price,
                atr,
                dynamic_success: false,
                price_move: 0.0,
                trade_triggered: false,
                trade_profit: 0.0,
                validated: false,
            },
            target_price,
            window_bars: window_bars(timeframe),
            bars_elapsed: 0,
            highest_seen: price,
            lowest_seen: price,
        };
        self.pending
            .lock()
            .entry(key(symbol, timeframe))
            .or_default()
            .push(pending);
    }

    /// Advances every pending validation for the key by one bar, finalizing
    /// those whose window has elapsed.
    pub fn on_new_candle(&self, symbol: &str, timeframe: &str, candle: &Candle) {
        let mut finalized = 0usize;
        {
            let mut pending = self.pending.lock();
            let Some(list) = pending.get_mut(&key(symbol, timeframe)) else {
                return;
            };
            let mut remaining = Vec::with_capacity(list.len());
            for mut pv in list.drain(..) {
                pv.bars_elapsed += 1;
                pv.highest_seen = pv.highest_seen.max(candle.high);
                pv.lowest_seen = pv.lowest_seen.min(candle.low);

                if pv.bars_elapsed >= pv.window_bars {
                    let mut record = pv.record;
                    if record.kind.is_bullish() {
                        record.dynamic_success = pv.highest_seen >= pv.target_price;
                        record.price_move =
                            (pv.highest_seen - record.price) / record.price * 100.0;
                    } else {
                        record.dynamic_success = pv.lowest_seen <= pv.target_price;
                        record.price_move =
                            (record.price - pv.lowest_seen) / record.price * 100.0;
                    }
                    record.validated = true;
                    self.scorer.add_record(record);
                    finalized += 1;
                } else {
                    remaining.push(pv);
                }
            }
            *list = remaining;
        }

        if finalized > 0 {
            let count = self.scorer.record_count();
            if count > 0 && count % WEIGHT_UPDATE_EVERY == 0 {
                self.scorer.update_weights();
                tracing::debug!(records = count, "divergence weights recomputed");
            }
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divergence::DivergenceKind;

    fn signal(kind: DivergenceKind) -> DivergenceSignal {
        DivergenceSignal {
            indicator: "mfi".to_string(),
            kind,
            distance: 12,
        }
    }

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            open_time_ms: 0,
            close_time_ms: 59_999,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
            trades: 1,
            taker_buy_volume: 0.5,
            taker_sell_volume: 0.5,
            is_final: true,
        }
    }

    #[test]
    fn bullish_validation_succeeds_when_target_reached() {
        let scorer = Arc::new(DivergenceScorer::new());
        let validator = DivergenceValidator::new(Arc::clone(&scorer));
        // price 100, atr 2 -> target 103.
        validator.register_signal(
            &signal(DivergenceKind::PositiveRegular),
            "ETHUSDT",
            "1h",
            100.0,
            2.0,
        );
        assert_eq!(validator.pending_count(), 1);
        // 1h window is 12 bars; spike through the target mid-window.
        for i in 0..12 {
            let high = if i == 4 { 103.5 } else { 101.0 };
            validator.on_new_candle("ETHUSDT", "1h", &candle(high, 99.5));
        }
        assert_eq!(validator.pending_count(), 0);
        let records = scorer.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].validated);
        assert!(records[0].dynamic_success);
        assert!((records[0].price_move - 3.5).abs() < 1e-9);
    }

    #[test]
    fn bearish_validation_fails_when_target_missed() {
        let scorer = Arc::new(DivergenceScorer::new());
        let validator = DivergenceValidator::new(Arc::clone(&scorer));
        // price 100, atr 2 -> bearish target 97; lows never get there.
        validator.register_signal(
            &signal(DivergenceKind::NegativeRegular),
            "ETHUSDT",
            "1h",
            100.0,
            2.0,
        );
        for _ in 0..12 {
            validator.on_new_candle("ETHUSDT", "1h", &candle(101.0, 98.5));
        }
        let records = scorer.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].validated);
        assert!(!records[0].dynamic_success);
        assert!((records[0].price_move - 1.5).abs() < 1e-9);
    }

    #[test]
    fn window_length_depends_on_timeframe() {
        let scorer = Arc::new(DivergenceScorer::new());
        let validator = DivergenceValidator::new(Arc::clone(&scorer));
        validator.register_signal(
            &signal(DivergenceKind::PositiveRegular),
            "ETHUSDT",
            "15m",
            100.0,
            2.0,
        );
        for _ in 0..19 {
            validator.on_new_candle("ETHUSDT", "15m", &candle(101.0, 99.0));
        }
        assert_eq!(validator.pending_count(), 1);
        validator.on_new_candle("ETHUSDT", "15m", &candle(101.0, 99.0));
        assert_eq!(validator.pending_count(), 0);
    }

    #[test]
    fn candles_for_other_keys_do_not_advance_the_window() {
        let scorer = Arc::new(DivergenceScorer::new());
        let validator = DivergenceValidator::new(Arc::clone(&scorer));
        validator.register_signal(
            &signal(DivergenceKind::PositiveRegular),
            "ETHUSDT",
            "1h",
            100.0,
            2.0,
        );
        validator.on_new_candle("BTCUSDT", "1h", &candle(101.0, 99.0));
        validator.on_new_candle("ETHUSDT", "4h", &candle(101.0, 99.0));
        assert_eq!(validator.pending_count(), 1);
    }

    #[test]
    fn zero_price_registration_is_rejected() {
        let scorer = Arc::new(DivergenceScorer::new());
        let validator = DivergenceValidator::new(Arc::clone(&scorer));
        validator.register_signal(
            &signal(DivergenceKind::PositiveRegular),
            "ETHUSDT",
            "1h",
            0.0,
            2.0,
        );
        assert_eq!(validator.pending_count(), 0);
    }

    #[test]
    fn every_tenth_validated_record_triggers_a_weight_update() {
        let scorer = Arc::new(DivergenceScorer::new());
        let validator = DivergenceValidator::new(Arc::clone(&scorer));
        // 25 effective samples with full success; once ten validations land
        // the recompute fires and lifts the weight above base.
        for _ in 0..30 {
            validator.register_signal(
                &signal(DivergenceKind::PositiveRegular),
                "ETHUSDT",
                "1h",
                100.0,
                2.0,
            );
        }
        for _ in 0..12 {
            validator.on_new_candle("ETHUSDT", "1h", &candle(104.0, 99.0));
        }
        assert_eq!(scorer.record_count(), 30);
        let weight = scorer.weights()["mfi"];
        assert!(weight > 2.0, "adaptive weight should exceed base, got {weight}");
    }
}
