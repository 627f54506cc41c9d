//! Weighted divergence scoring with an adaptive-weight feedback loop.
//!
//! Indicators fall into two classes: momentum (base weight 1.0) and volume
//! (base weight 2.0). Validation outcomes accumulate as time-decayed records
//! and periodically reshape the per-indicator weights within a clamped band
//! around the base.

use crate::divergence::DivergenceSignal;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const MOMENTUM_INDICATORS: [&str; 6] = ["macd", "macd_hist", "rsi", "stoch", "cci", "mom"];
const VOLUME_INDICATORS: [&str; 4] = ["obv", "vwmacd", "cmf", "mfi"];

const BASE_MOMENTUM_WEIGHT: f64 = 1.0;
const BASE_VOLUME_WEIGHT: f64 = 2.0;
const MIN_WEIGHT_RATIO: f64 = 0.5;
const MAX_WEIGHT_RATIO: f64 = 2.0;
const HALF_LIFE_DAYS: f64 = 30.0;
const THRESHOLD_RATIO: f64 = 0.4;
const MIN_SAMPLES_FOR_ADAPT: f64 = 20.0;
const TRADE_WEIGHT_FLOOR: f64 = 10.0;

/// A validated (or pending-validation) divergence observation used for
/// weight learning. Persisted externally; mutated at most once to attach a
/// trade outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub timestamp: DateTime<Utc>,
    pub indicator: String,
    #[serde(rename = "type")]
    pub kind: crate::divergence::DivergenceKind,
    pub symbol: String,
    pub timeframe: String,
    pub price: f64,
    pub atr: f64,
    pub dynamic_success: bool,
    #[serde(rename = "price_move_pct")]
    pub price_move: f64,
    pub trade_triggered: bool,
    pub trade_profit: f64,
    pub validated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredSignal {
    pub indicator: String,
    #[serde(rename = "type")]
    pub kind: crate::divergence::DivergenceKind,
    pub weight: f64,
    pub distance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Conflict,
    None,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Conflict => "conflict",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreResult {
    pub direction: Direction,
    pub bullish_score: f64,
    pub bearish_score: f64,
    pub bullish_threshold: f64,
    pub bearish_threshold: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<ScoredSignal>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub weights: HashMap<String, f64>,
}

impl ScoreResult {
    fn none() -> Self {
        Self {
            direction: Direction::None,
            bullish_score: 0.0,
            bearish_score: 0.0,
            bullish_threshold: 0.0,
            bearish_threshold: 0.0,
            signals: Vec::new(),
            weights: HashMap::new(),
        }
    }
}

#[must_use]
pub fn base_weight(indicator: &str) -> f64 {
    if MOMENTUM_INDICATORS.contains(&indicator) {
        BASE_MOMENTUM_WEIGHT
    } else if VOLUME_INDICATORS.contains(&indicator) {
        BASE_VOLUME_WEIGHT
    } else {
        1.0
    }
}

/// Scores divergence signals against the live weight map and learns new
/// weights from validated records.
pub struct DivergenceScorer {
    /// Swapped wholesale on recompute so a scoring call reads one consistent
    /// snapshot for its whole duration.
    weights: RwLock<Arc<HashMap<String, f64>>>,
    records: Mutex<Vec<DivergenceRecord>>,
}

impl Default for DivergenceScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl DivergenceScorer {
    #[must_use]
    pub fn new() -> Self {
        let mut weights = HashMap::new();
        for name in MOMENTUM_INDICATORS {
            weights.insert(name.to_string(), BASE_MOMENTUM_WEIGHT);
        }
        for name in VOLUME_INDICATORS {
            weights.insert(name.to_string(), BASE_VOLUME_WEIGHT);
        }
        Self {
            weights: RwLock::new(Arc::new(weights)),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Pure with respect to the weight snapshot taken at entry: the same
    /// signals and weights always produce the same result.
    #[must_use]
    pub fn score(&self, signals: &[DivergenceSignal]) -> ScoreResult {
        let weights = Arc::clone(&self.weights.read());
        score_with_weights(signals, &weights)
    }

    /// Current per-indicator weights.
    #[must_use]
    pub fn weights(&self) -> HashMap<String, f64> {
        self.weights.read().as_ref().clone()
    }

    pub fn add_record(&self, record: DivergenceRecord) {
        self.records.lock().push(record);
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn records(&self) -> Vec<DivergenceRecord> {
        self.records.lock().clone()
    }

    /// Replaces the record set, e.g. when restoring persisted history.
    pub fn load_records(&self, records: Vec<DivergenceRecord>) {
        *self.records.lock() = records;
    }

    /// Attaches a trade outcome to the matching record (same identity within
    /// an hour of the signal timestamp). At most one record is mutated.
    pub fn mark_trade_result(
        &self,
        symbol: &str,
        timeframe: &str,
        indicator: &str,
        kind: crate::divergence::DivergenceKind,
        at: DateTime<Utc>,
        profit: f64,
    ) {
        let mut records = self.records.lock();
        if let Some(record) = records.iter_mut().find(|r| {
            r.symbol == symbol
                && r.timeframe == timeframe
                && r.indicator == indicator
                && r.kind == kind
                && (r.timestamp - at).num_seconds().abs() < 3600
        }) {
            record.trade_triggered = true;
            record.trade_profit = profit;
        }
    }

    /// Recomputes weights from the validated records and swaps the live map.
    pub fn update_weights(&self) {
        self.update_weights_at(Utc::now());
    }

    pub(crate) fn update_weights_at(&self, now: DateTime<Utc>) {
        #[derive(Default)]
        struct Stat {
            total: f64,
            dynamic_success: f64,
            trade: f64,
            trade_profit: f64,
        }

        let mut stats: HashMap<String, Stat> = HashMap::new();
        for record in self.records.lock().iter().filter(|r| r.validated) {
            let stat = stats.entry(record.indicator.clone()).or_default();
            let decay = decay_factor(now, record.timestamp);
            stat.total += decay;
            if record.dynamic_success {
                stat.dynamic_success += decay;
            }
            if record.trade_triggered {
                stat.trade += decay;
                if record.trade_profit > 0.0 {
                    stat.trade_profit += decay;
                }
            }
        }

        let mut next = self.weights.read().as_ref().clone();
        for (indicator, stat) in stats {
            if stat.total < MIN_SAMPLES_FOR_ADAPT {
                continue;
            }
            let dynamic_rate = stat.dynamic_success / stat.total;
            let trade_rate = if stat.trade > 0.0 {
                stat.trade_profit / stat.trade
            } else {
                0.5
            };
            let trade_ratio = if stat.trade >= TRADE_WEIGHT_FLOOR { 0.7 } else { 0.3 };
            let mix = trade_ratio * trade_rate + (1.0 - trade_ratio) * dynamic_rate;
            let base = base_weight(&indicator);
            let weight = (base * (0.5 + mix))
                .clamp(base * MIN_WEIGHT_RATIO, base * MAX_WEIGHT_RATIO);
            next.insert(indicator, crate::series::round4(weight));
        }
        *self.weights.write() = Arc::new(next);
    }
}

/// Scoring against an explicit weight map; a deterministic function of its
/// inputs.
#[must_use]
pub fn score_with_weights(
    signals: &[DivergenceSignal],
    weights: &HashMap<String, f64>,
) -> ScoreResult {
    if signals.is_empty() {
        return ScoreResult::none();
    }

    let mut bullish_score = 0.0;
    let mut bearish_score = 0.0;
    let mut bullish_max = 0.0;
    let mut bearish_max = 0.0;
    let mut scored = Vec::with_capacity(signals.len());
    for signal in signals {
        let weight = weights
            .get(&signal.indicator)
            .copied()
            .unwrap_or_else(|| base_weight(&signal.indicator));
        if signal.kind.is_bullish() {
            bullish_score += weight;
            bullish_max += weight;
        } else {
            bearish_score += weight;
            bearish_max += weight;
        }
        scored.push(ScoredSignal {
            indicator: signal.indicator.clone(),
            kind: signal.kind,
            weight,
            distance: signal.distance,
        });
    }

    let bullish_threshold = bullish_max * THRESHOLD_RATIO;
    let bearish_threshold = bearish_max * THRESHOLD_RATIO;
    let bullish_valid = bullish_score >= bullish_threshold && bullish_threshold > 0.0;
    let bearish_valid = bearish_score >= bearish_threshold && bearish_threshold > 0.0;
    let direction = match (bullish_valid, bearish_valid) {
        (true, true) => Direction::Conflict,
        (true, false) => Direction::Up,
        (false, true) => Direction::Down,
        (false, false) => Direction::None,
    };

    ScoreResult {
        direction,
        bullish_score: round2(bullish_score),
        bearish_score: round2(bearish_score),
        bullish_threshold: round2(bullish_threshold),
        bearish_threshold: round2(bearish_threshold),
        signals: scored,
        weights: weights.clone(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn decay_factor(now: DateTime<Utc>, ts: DateTime<Utc>) -> f64 {
    let days = ((now - ts).num_seconds().max(0) as f64) / 86_400.0;
    0.5_f64.powf(days / HALF_LIFE_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::divergence::DivergenceKind;
    use chrono::Duration;

    fn signal(indicator: &str, kind: DivergenceKind) -> DivergenceSignal {
        DivergenceSignal {
            indicator: indicator.to_string(),
            kind,
            distance: 10,
        }
    }

    #[test]
    fn default_weights_score_up_direction() {
        let scorer = DivergenceScorer::new();
        let signals = vec![
            signal("macd", DivergenceKind::PositiveRegular),
            signal("rsi", DivergenceKind::PositiveRegular),
            signal("mfi", DivergenceKind::PositiveRegular),
        ];
        let result = scorer.score(&signals);
        assert_eq!(result.bullish_score, 4.0);
        assert_eq!(result.bullish_threshold, 1.6);
        assert_eq!(result.direction, Direction::Up);
        assert_eq!(result.bearish_score, 0.0);
    }

    #[test]
    fn opposing_signals_conflict() {
        let scorer = DivergenceScorer::new();
        let signals = vec![
            signal("macd", DivergenceKind::PositiveRegular),
            signal("mfi", DivergenceKind::NegativeRegular),
        ];
        let result = scorer.score(&signals);
        assert_eq!(result.direction, Direction::Conflict);
    }

    #[test]
    fn empty_signals_score_none() {
        let scorer = DivergenceScorer::new();
        let result = scorer.score(&[]);
        assert_eq!(result.direction, Direction::None);
        assert_eq!(result.bullish_score, 0.0);
    }

    #[test]
    fn adding_a_bullish_signal_never_lowers_the_bullish_score() {
        let scorer = DivergenceScorer::new();
        let mut signals = vec![signal("macd", DivergenceKind::PositiveRegular)];
        let before = scorer.score(&signals).bullish_score;
        signals.push(signal("cci", DivergenceKind::PositiveHidden));
        let after = scorer.score(&signals).bullish_score;
        assert!(after >= before);
    }

    #[test]
    fn scoring_is_deterministic() {
        let scorer = DivergenceScorer::new();
        let signals = vec![
            signal("stoch", DivergenceKind::PositiveHidden),
            signal("obv", DivergenceKind::NegativeHidden),
        ];
        let a = scorer.score(&signals);
        let b = scorer.score(&signals);
        assert_eq!(a.bullish_score, b.bullish_score);
        assert_eq!(a.bearish_score, b.bearish_score);
        assert_eq!(a.direction, b.direction);
    }

    fn validated_record(indicator: &str, ts: DateTime<Utc>, success: bool) -> DivergenceRecord {
        DivergenceRecord {
            timestamp: ts,
            indicator: indicator.to_string(),
            kind: DivergenceKind::PositiveRegular,
            symbol: "ETHUSDT".to_string(),
            timeframe: "1h".to_string(),
            price: 2840.0,
            atr: 12.0,
            dynamic_success: success,
            price_move: 1.0,
            trade_triggered: false,
            trade_profit: 0.0,
            validated: true,
        }
    }

    #[test]
    fn perfect_dynamic_rate_without_trades_gives_1_6_weight() {
        let scorer = DivergenceScorer::new();
        let now = Utc::now();
        for _ in 0..20 {
            scorer.add_record(validated_record("mfi", now, true));
        }
        scorer.update_weights_at(now);
        // No trades: trade_rate defaults to 0.5 at share 0.3, dynamic 1.0 at
        // share 0.7 -> mix 0.85 -> 2.0 * (0.5 + 0.85) = 2.7.
        let w = scorer.weights()["mfi"];
        assert!((w - 2.7).abs() < 1e-9, "weight {w}");
    }

    #[test]
    fn weights_stay_clamped_to_half_and_double_base() {
        let scorer = DivergenceScorer::new();
        let now = Utc::now();
        for _ in 0..30 {
            scorer.add_record(validated_record("macd", now, false));
        }
        scorer.update_weights_at(now);
        let w = scorer.weights()["macd"];
        // dynamic 0, trade_rate default 0.5 with ratio 0.3 -> mix 0.15,
        // unclamped 1*(0.65) = 0.65, floor is 0.5 so stays 0.65.
        assert!((w - 0.65).abs() < 1e-9, "weight {w}");
        assert!(w >= 0.5 && w <= 2.0);
    }

    #[test]
    fn too_few_samples_leave_weight_at_base() {
        let scorer = DivergenceScorer::new();
        let now = Utc::now();
        for _ in 0..10 {
            scorer.add_record(validated_record("cmf", now, true));
        }
        scorer.update_weights_at(now);
        assert_eq!(scorer.weights()["cmf"], BASE_VOLUME_WEIGHT);
    }

    #[test]
    fn old_records_decay_out_of_the_sample_floor() {
        let scorer = DivergenceScorer::new();
        let now = Utc::now();
        // 25 records aged 60 days decay to 25 * 0.25 = 6.25 effective.
        for _ in 0..25 {
            scorer.add_record(validated_record("obv", now - Duration::days(60), true));
        }
        scorer.update_weights_at(now);
        assert_eq!(scorer.weights()["obv"], BASE_VOLUME_WEIGHT);
    }

    #[test]
    fn trade_results_dominate_when_enough_trades_exist() {
        let scorer = DivergenceScorer::new();
        let now = Utc::now();
        for _ in 0..20 {
            let mut record = validated_record("mfi", now, true);
            record.trade_triggered = true;
            record.trade_profit = 5.0;
            scorer.add_record(record);
        }
        scorer.update_weights_at(now);
        // trade >= 10 effective -> ratio 0.7; both rates 1.0 -> mix 1.0;
        // 2*(1.5) = 3.0.
        assert!((scorer.weights()["mfi"] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn mark_trade_result_updates_one_matching_record() {
        let scorer = DivergenceScorer::new();
        let now = Utc::now();
        scorer.add_record(validated_record("rsi", now, true));
        scorer.add_record(validated_record("rsi", now, true));
        scorer.mark_trade_result(
            "ETHUSDT",
            "1h",
            "rsi",
            DivergenceKind::PositiveRegular,
            now,
            3.5,
        );
        let records = scorer.records();
        let marked: Vec<_> = records.iter().filter(|r| r.trade_triggered).collect();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].trade_profit, 3.5);
    }

    #[test]
    fn unknown_indicator_scores_with_unit_weight() {
        let result = score_with_weights(
            &[signal("mystery", DivergenceKind::PositiveRegular)],
            &HashMap::new(),
        );
        assert_eq!(result.bullish_score, 1.0);
    }
}
