//! Versioned, JSON-serializable indicator snapshot.
//!
//! The snapshot is the machine-readable view of one (symbol, interval)
//! window: per-indicator latest values, short tails, period bands and
//! qualitative states, plus the embedded multi-indicator divergence block.

use crate::divergence::{self, DivergenceSignal};
use crate::engine::{IndicatorValue, Report};
use crate::scoring::{DivergenceScorer, ScoreResult};
use crate::series;
use crate::wtmfi::WtMfiSettings;
use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use helmsman_core::Candle;
use serde::Serialize;

pub const SNAPSHOT_VERSION: &str = "indicator_snapshot_v1";
const DIVERGENCE_LOOKBACK: usize = 6;

#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSnapshot {
    #[serde(rename = "_meta")]
    pub meta: SnapshotMeta,
    pub market: SnapshotMarket,
    pub data: SnapshotData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMeta {
    pub series_order: String,
    pub sampled_at: String,
    pub version: String,
    #[serde(rename = "timestamp_now_ts")]
    pub timestamp_now: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_age_sec: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMarket {
    pub symbol: String,
    pub interval: String,
    pub current_price: f64,
    pub price_timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_fast: Option<EmaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_mid: Option<EmaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_slow: Option<EmaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_long: Option<EmaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<MacdSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<RsiSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obv: Option<ObvSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stoch_k: Option<StochSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<AtrSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wt_mfi_hybrid: Option<WtMfiSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence_multi: Option<DivergenceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmaSnapshot {
    pub latest: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_n: Vec<f64>,
    pub period_high: f64,
    pub period_low: f64,
    pub delta_to_price: f64,
    pub delta_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MacdSnapshot {
    pub dif: f64,
    pub dea: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub histogram: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_slope: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub slope_state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub divergence: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RsiSnapshot {
    pub current: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_n: Vec<f64>,
    pub period_high: f64,
    pub period_low: f64,
    pub distance_to_high: f64,
    pub distance_to_low: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_slope: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub slope_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObvSnapshot {
    pub latest: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_n: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StochSnapshot {
    pub current: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_n: Vec<f64>,
    pub range_min: f64,
    pub range_max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AtrSnapshot {
    pub latest: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_n: Vec<f64>,
    pub range_min: f64,
    pub range_max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WtMfiSnapshot {
    pub latest: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub last_n: Vec<f64>,
    pub period_high: f64,
    pub period_low: f64,
    pub overbought: f64,
    pub oversold: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_slope: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub slope_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DivergenceSnapshot {
    pub total: usize,
    pub min_count: usize,
    pub source: String,
    pub search_mode: String,
    pub pivot_period: usize,
    pub max_pivot_points: usize,
    pub max_bars: usize,
    pub positive_count: usize,
    pub negative_count: usize,
    pub positive_regular_detected: bool,
    pub negative_regular_detected: bool,
    pub positive_hidden_detected: bool,
    pub negative_hidden_detected: bool,
    pub positive_detected: bool,
    pub negative_detected: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<DivergenceSignal>,
    pub direction: String,
    pub bullish_score: f64,
    pub bearish_score: f64,
    pub bullish_threshold: f64,
    pub bearish_threshold: f64,
}

/// Builds the snapshot from a candle window and its computed report.
///
/// # Errors
/// Fails on an empty window or an empty report.
pub fn build_snapshot(
    candles: &[Candle],
    report: &Report,
    wtmfi_settings: WtMfiSettings,
    rsi_enabled: bool,
    scorer: &DivergenceScorer,
) -> Result<IndicatorSnapshot> {
    if candles.is_empty() {
        bail!("indicator snapshot: no candles");
    }
    if report.values.is_empty() {
        bail!("indicator snapshot: empty report");
    }
    let last = candles[candles.len() - 1];
    let stamp = candle_timestamp(&last);
    let price = last.close;
    let now = Utc::now();

    let data_age_sec = (last.close_time_ms > 0)
        .then(|| ((now.timestamp_millis() - last.close_time_ms) / 1000).max(0));

    let mut data = SnapshotData::default();
    let tails = [("ema_fast", 5), ("ema_mid", 4), ("ema_slow", 3), ("ema_long", 3)];
    for (name, tail) in tails {
        if let Some(value) = report.values.get(name) {
            let snap = build_ema(value, price, tail);
            match name {
                "ema_fast" => data.ema_fast = snap,
                "ema_mid" => data.ema_mid = snap,
                "ema_slow" => data.ema_slow = snap,
                _ => data.ema_long = snap,
            }
        }
    }
    if report.values.contains_key("macd") {
        data.macd = build_macd(candles, 3);
    }
    if rsi_enabled {
        if let Some(value) = report.values.get("rsi") {
            data.rsi = build_rsi(value);
        }
    }
    if let Some(value) = report.values.get("obv") {
        data.obv = build_obv(value);
    }
    if let Some(value) = report.values.get("stoch_k") {
        data.stoch_k = build_stoch(value);
    }
    if let Some(value) = report.values.get("atr") {
        data.atr = build_atr(value);
    }
    if let Some(value) = report.values.get("wt_mfi_hybrid") {
        data.wt_mfi_hybrid = build_wtmfi(value, wtmfi_settings);
    }
    data.divergence_multi = build_divergence(candles, rsi_enabled, scorer);

    Ok(IndicatorSnapshot {
        meta: SnapshotMeta {
            series_order: "oldest_to_latest".to_string(),
            sampled_at: stamp.clone(),
            version: SNAPSHOT_VERSION.to_string(),
            timestamp_now: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            data_age_sec,
        },
        market: SnapshotMarket {
            symbol: report.symbol.clone(),
            interval: report.interval.clone(),
            current_price: series::round4(price),
            price_timestamp: stamp,
        },
        data,
    })
}

fn build_ema(value: &IndicatorValue, price: f64, tail: usize) -> Option<EmaSnapshot> {
    if value.latest == 0.0 && value.series.is_empty() {
        return None;
    }
    let (period_high, period_low) = series::bounds(&value.series);
    let delta = price - value.latest;
    let delta_pct = if value.latest == 0.0 {
        0.0
    } else {
        delta / value.latest * 100.0
    };
    Some(EmaSnapshot {
        latest: series::round4(value.latest),
        last_n: tail_of(&value.series, tail),
        period_high,
        period_low,
        delta_to_price: series::round4(delta),
        delta_pct: series::round4(delta_pct),
    })
}

fn build_macd(candles: &[Candle], tail: usize) -> Option<MacdSnapshot> {
    let (closes, _, _, _) = crate::engine::extract_series(candles);
    let (line, signal, hist) = series::macd(&closes, 12, 26, 9);
    let line = series::sanitize(&line);
    let signal = series::sanitize(&signal);
    let hist = series::sanitize(&hist);
    if line.is_empty() || signal.is_empty() || hist.is_empty() {
        return None;
    }
    let hist_tail = tail_of(&hist, tail);
    let (slope, normalized) = compute_slope(&hist_tail);
    Some(MacdSnapshot {
        dif: line[line.len() - 1],
        dea: signal[signal.len() - 1],
        histogram: hist_tail,
        slope,
        normalized_slope: normalized,
        slope_state: slope_state(normalized),
        divergence: simple_divergence(&closes, &hist, DIVERGENCE_LOOKBACK).to_string(),
    })
}

fn build_rsi(value: &IndicatorValue) -> Option<RsiSnapshot> {
    if value.latest == 0.0 && value.series.is_empty() {
        return None;
    }
    let (period_high, period_low) = series::bounds(&value.series);
    let last_n = tail_of(&value.series, 3);
    let (slope, normalized) = compute_slope(&last_n);
    Some(RsiSnapshot {
        current: series::round4(value.latest),
        last_n,
        period_high,
        period_low,
        distance_to_high: series::round4(period_high - value.latest),
        distance_to_low: series::round4(value.latest - period_low),
        slope,
        normalized_slope: normalized,
        slope_state: slope_state(normalized),
    })
}

fn build_obv(value: &IndicatorValue) -> Option<ObvSnapshot> {
    if value.series.is_empty() {
        return None;
    }
    Some(ObvSnapshot {
        latest: series::round4(value.latest),
        last_n: tail_of(&value.series, 3),
    })
}

fn build_stoch(value: &IndicatorValue) -> Option<StochSnapshot> {
    if value.series.is_empty() {
        return None;
    }
    Some(StochSnapshot {
        current: series::round4(value.latest),
        last_n: tail_of(&value.series, 2),
        range_min: 0.0,
        range_max: 100.0,
    })
}

fn build_atr(value: &IndicatorValue) -> Option<AtrSnapshot> {
    if value.latest == 0.0 && value.series.is_empty() {
        return None;
    }
    let (range_max, range_min) = series::bounds(&value.series);
    Some(AtrSnapshot {
        latest: series::round4(value.latest),
        last_n: tail_of(&value.series, 3),
        range_min,
        range_max,
        change_pct: change_pct(&value.series),
    })
}

fn build_wtmfi(value: &IndicatorValue, settings: WtMfiSettings) -> Option<WtMfiSnapshot> {
    if value.latest == 0.0 && value.series.is_empty() {
        return None;
    }
    let (period_high, period_low) = series::bounds(&value.series);
    let last_n = tail_of(&value.series, 3);
    let (slope, normalized) = compute_slope(&last_n);
    Some(WtMfiSnapshot {
        latest: series::round4(value.latest),
        last_n,
        period_high,
        period_low,
        overbought: settings.overbought,
        oversold: settings.oversold,
        state: value.state.clone(),
        slope,
        normalized_slope: normalized,
        slope_state: slope_state(normalized),
    })
}

fn build_divergence(
    candles: &[Candle],
    rsi_enabled: bool,
    scorer: &DivergenceScorer,
) -> Option<DivergenceSnapshot> {
    if candles.len() < divergence::PIVOT_PERIOD * 2 + 2 {
        return None;
    }
    let signals = divergence::compute_signals(candles, rsi_enabled);
    let positive_count = signals.iter().filter(|s| s.kind.is_bullish()).count();
    let negative_count = signals.len() - positive_count;
    let detected = |kind: crate::divergence::DivergenceKind| signals.iter().any(|s| s.kind == kind);
    let positive_regular = detected(crate::divergence::DivergenceKind::PositiveRegular);
    let negative_regular = detected(crate::divergence::DivergenceKind::NegativeRegular);
    let positive_hidden = detected(crate::divergence::DivergenceKind::PositiveHidden);
    let negative_hidden = detected(crate::divergence::DivergenceKind::NegativeHidden);
    let score: ScoreResult = scorer.score(&signals);

    Some(DivergenceSnapshot {
        total: signals.len(),
        min_count: divergence::MIN_SIGNAL_COUNT,
        source: "close".to_string(),
        search_mode: "regular_hidden".to_string(),
        pivot_period: divergence::PIVOT_PERIOD,
        max_pivot_points: divergence::MAX_PIVOT_POINTS,
        max_bars: divergence::MAX_BARS,
        positive_count,
        negative_count,
        positive_regular_detected: positive_regular,
        negative_regular_detected: negative_regular,
        positive_hidden_detected: positive_hidden,
        negative_hidden_detected: negative_hidden,
        positive_detected: positive_regular || positive_hidden,
        negative_detected: negative_regular || negative_hidden,
        signals,
        direction: score.direction.as_str().to_string(),
        bullish_score: score.bullish_score,
        bearish_score: score.bearish_score,
        bullish_threshold: score.bullish_threshold,
        bearish_threshold: score.bearish_threshold,
    })
}

fn tail_of(series_in: &[f64], n: usize) -> Vec<f64> {
    if n == 0 || series_in.is_empty() {
        return Vec::new();
    }
    let start = series_in.len().saturating_sub(n);
    series_in[start..].iter().map(|v| series::round4(*v)).collect()
}

/// Slope over the last up-to-5 samples: raw per-step delta and the delta
/// normalized by the first sample's magnitude, in percent per step.
fn compute_slope(tail: &[f64]) -> (Option<f64>, Option<f64>) {
    if tail.len() < 2 {
        return (None, None);
    }
    let start = tail.len().saturating_sub(5);
    let window = &tail[start..];
    let first = window[0];
    let last = window[window.len() - 1];
    let steps = (window.len() - 1) as f64;
    if steps <= 0.0 {
        return (None, None);
    }
    let delta = last - first;
    let raw = series::round4(delta / steps);
    let normalized = (first.abs() > 1e-9)
        .then(|| series::round4(delta / first.abs() * 100.0 / steps));
    (Some(raw), normalized)
}

fn slope_state(normalized: Option<f64>) -> String {
    let Some(norm) = normalized else {
        return String::new();
    };
    let abs = norm.abs();
    if abs < 0.1 {
        "FLAT"
    } else if abs < 0.4 {
        "MODERATE"
    } else {
        "STEEP"
    }
    .to_string()
}

fn change_pct(series_in: &[f64]) -> Option<f64> {
    if series_in.len() < 2 {
        return None;
    }
    let last = series_in[series_in.len() - 1];
    let prev = series_in[series_in.len() - 2];
    (prev.abs() > 1e-9).then(|| series::round4((last - prev) / prev * 100.0))
}

/// Coarse direction check between price and an indicator `lookback` bars
/// apart: price up while indicator down reads bearish and vice versa.
fn simple_divergence(prices: &[f64], indicators: &[f64], lookback: usize) -> &'static str {
    let n = prices.len().min(indicators.len());
    if lookback == 0 || n <= lookback {
        return "neutral";
    }
    let prices = &prices[prices.len() - n..];
    let indicators = &indicators[indicators.len() - n..];
    let end = n - 1;
    let prev = end - lookback;
    if prices[end] > prices[prev] && indicators[end] < indicators[prev] {
        "down"
    } else if prices[end] < prices[prev] && indicators[end] > indicators[prev] {
        "up"
    } else {
        "neutral"
    }
}

fn candle_timestamp(candle: &Candle) -> String {
    let ts = candle.timestamp_ms();
    if ts == 0 {
        return Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    }
    Utc.timestamp_millis_opt(ts)
        .single()
        .map_or_else(
            || Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            |dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::compute_report;
    use helmsman_core::IndicatorConfig;

    #[test]
    fn snapshot_carries_meta_and_market_sections() {
        let candles = crate::engine::tests::window(240);
        let cfg = IndicatorConfig::default();
        let report = compute_report("ETHUSDT", "1h", &candles, &cfg).unwrap();
        let scorer = DivergenceScorer::new();
        let snapshot =
            build_snapshot(&candles, &report, WtMfiSettings::default(), true, &scorer).unwrap();
        assert_eq!(snapshot.meta.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.meta.series_order, "oldest_to_latest");
        assert_eq!(snapshot.market.symbol, "ETHUSDT");
        assert!(snapshot.market.current_price > 0.0);
        assert!(snapshot.data.ema_fast.is_some());
        assert!(snapshot.data.macd.is_some());
        assert!(snapshot.data.rsi.is_some());
        assert!(snapshot.data.wt_mfi_hybrid.is_some());
        assert!(snapshot.data.divergence_multi.is_some());
    }

    #[test]
    fn snapshot_serializes_with_wire_field_names() {
        let candles = crate::engine::tests::window(240);
        let cfg = IndicatorConfig::default();
        let report = compute_report("ETHUSDT", "1h", &candles, &cfg).unwrap();
        let scorer = DivergenceScorer::new();
        let snapshot =
            build_snapshot(&candles, &report, WtMfiSettings::default(), true, &scorer).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("_meta").is_some());
        assert!(json["data"].get("wt_mfi_hybrid").is_some());
        assert_eq!(json["_meta"]["version"], SNAPSHOT_VERSION);
    }

    #[test]
    fn rsi_block_omitted_when_disabled() {
        let candles = crate::engine::tests::window(240);
        let cfg = IndicatorConfig {
            rsi_enabled: false,
            ..IndicatorConfig::default()
        };
        let report = compute_report("ETHUSDT", "1h", &candles, &cfg).unwrap();
        let scorer = DivergenceScorer::new();
        let snapshot =
            build_snapshot(&candles, &report, WtMfiSettings::default(), false, &scorer).unwrap();
        assert!(snapshot.data.rsi.is_none());
    }

    #[test]
    fn empty_inputs_are_errors() {
        let scorer = DivergenceScorer::new();
        let report = Report {
            symbol: "ETHUSDT".to_string(),
            interval: "1h".to_string(),
            count: 0,
            values: std::collections::HashMap::new(),
        };
        assert!(build_snapshot(&[], &report, WtMfiSettings::default(), true, &scorer).is_err());
    }

    #[test]
    fn slope_states_use_the_configured_bands() {
        assert_eq!(slope_state(Some(0.05)), "FLAT");
        assert_eq!(slope_state(Some(0.2)), "MODERATE");
        assert_eq!(slope_state(Some(-0.9)), "STEEP");
        assert_eq!(slope_state(None), "");
    }

    #[test]
    fn simple_divergence_reads_direction_disagreement() {
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let falling = vec![7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0];
        assert_eq!(simple_divergence(&prices, &falling, 6), "down");
        assert_eq!(simple_divergence(&falling, &prices, 6), "up");
        assert_eq!(simple_divergence(&prices, &prices, 6), "neutral");
    }
}
