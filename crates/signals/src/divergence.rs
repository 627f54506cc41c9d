//! Multi-indicator divergence detection.
//!
//! Ten momentum/volume series are each tested against recent close-price
//! pivots for the four divergence classes. A candidate only survives when
//! the indicator and the close both stay on the correct side of the straight
//! line from the pivot to the current bar for every intermediate bar.

use crate::series;
use helmsman_core::Candle;
use serde::{Deserialize, Serialize};

pub const PIVOT_PERIOD: usize = 5;
pub const MAX_PIVOT_POINTS: usize = 10;
pub const MAX_BARS: usize = 100;
pub const MIN_SIGNAL_COUNT: usize = 1;

/// Indicators participating in divergence detection, in evaluation order.
pub const INDICATOR_NAMES: [&str; 10] = [
    "macd", "macd_hist", "rsi", "stoch", "cci", "mom", "obv", "vwmacd", "cmf", "mfi",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    PositiveRegular,
    NegativeRegular,
    PositiveHidden,
    NegativeHidden,
}

impl DivergenceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PositiveRegular => "positive_regular",
            Self::NegativeRegular => "negative_regular",
            Self::PositiveHidden => "positive_hidden",
            Self::NegativeHidden => "negative_hidden",
        }
    }

    /// `positive_*` classes are bullish, `negative_*` bearish.
    #[must_use]
    pub const fn is_bullish(self) -> bool {
        matches!(self, Self::PositiveRegular | Self::PositiveHidden)
    }

    #[must_use]
    pub const fn is_hidden(self) -> bool {
        matches!(self, Self::PositiveHidden | Self::NegativeHidden)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceSignal {
    pub indicator: String,
    #[serde(rename = "type")]
    pub kind: DivergenceKind,
    /// Bars between the pivot and the current bar; always in (5, 100].
    pub distance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanMode {
    Regular,
    Hidden,
}

/// Computes all divergence signals over the window. Returns an empty vec for
/// windows too short to hold a pivot neighborhood.
#[must_use]
pub fn compute_signals(candles: &[Candle], use_rsi: bool) -> Vec<DivergenceSignal> {
    if candles.len() < PIVOT_PERIOD * 2 + 2 {
        return Vec::new();
    }
    let (closes, highs, lows, volumes) = crate::engine::extract_series(candles);
    let pivot_lows = collect_pivots(&closes, PIVOT_PERIOD, false, MAX_PIVOT_POINTS);
    let pivot_highs = collect_pivots(&closes, PIVOT_PERIOD, true, MAX_PIVOT_POINTS);
    if pivot_lows.is_empty() && pivot_highs.is_empty() {
        return Vec::new();
    }

    let (macd_line, _, macd_hist) = series::macd(&closes, 12, 26, 9);
    let stoch = series::sma(&series::stoch_fast_k(&closes, &highs, &lows, 14), 3);
    let vwmacd = series::diff(
        &series::vwma(&closes, &volumes, 12),
        &series::vwma(&closes, &volumes, 26),
    );

    let mut indicator_series: Vec<(&str, Vec<f64>)> = vec![
        ("macd", macd_line),
        ("macd_hist", macd_hist),
    ];
    if use_rsi {
        indicator_series.push(("rsi", series::rsi(&closes, 14)));
    }
    indicator_series.extend([
        ("stoch", stoch),
        ("cci", series::cci(&highs, &lows, &closes, 10)),
        ("mom", series::mom(&closes, 10)),
        ("obv", series::obv(&closes, &volumes)),
        ("vwmacd", vwmacd),
        ("cmf", series::cmf(&highs, &lows, &closes, &volumes, 21)),
        ("mfi", series::mfi(&highs, &lows, &closes, &volumes, 14)),
    ]);

    let mut signals = Vec::new();
    for (name, ind) in &indicator_series {
        if ind.is_empty() {
            continue;
        }
        let checks = [
            (DivergenceKind::PositiveRegular, ScanMode::Regular),
            (DivergenceKind::NegativeRegular, ScanMode::Regular),
            (DivergenceKind::PositiveHidden, ScanMode::Hidden),
            (DivergenceKind::NegativeHidden, ScanMode::Hidden),
        ];
        for (kind, mode) in checks {
            let distance = if kind.is_bullish() {
                bullish_scan(ind, &closes, &pivot_lows, mode)
            } else {
                bearish_scan(ind, &closes, &pivot_highs, mode)
            };
            if distance > 0 {
                signals.push(DivergenceSignal {
                    indicator: (*name).to_string(),
                    kind,
                    distance,
                });
            }
        }
    }
    if signals.len() < MIN_SIGNAL_COUNT {
        return Vec::new();
    }
    signals
}

/// Collects up to `max_keep` pivot positions, newest first. A pivot is a
/// strict extremum against every neighbor within `period` bars.
#[must_use]
pub(crate) fn collect_pivots(
    values: &[f64],
    period: usize,
    is_high: bool,
    max_keep: usize,
) -> Vec<(usize, f64)> {
    if values.len() < period * 2 + 1 || period == 0 || max_keep == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(max_keep);
    for idx in (period..=values.len() - 1 - period).rev() {
        if is_pivot(values, idx, period, is_high) {
            out.push((idx, values[idx]));
            if out.len() >= max_keep {
                break;
            }
        }
    }
    out
}

fn is_pivot(values: &[f64], idx: usize, period: usize, is_high: bool) -> bool {
    let center = values[idx];
    if !center.is_finite() {
        return false;
    }
    for i in idx - period..=idx + period {
        if i == idx {
            continue;
        }
        let v = values[i];
        if !v.is_finite() {
            return false;
        }
        if is_high && v >= center {
            return false;
        }
        if !is_high && v <= center {
            return false;
        }
    }
    true
}

/// Looks for a bullish divergence against the pivot lows.
///
/// Regular: indicator higher low while price lower low. Hidden: indicator
/// lower low while price higher low. Returns the pivot distance, or 0.
pub(crate) fn bullish_scan(
    src: &[f64],
    closes: &[f64],
    pivot_lows: &[(usize, f64)],
    mode: ScanMode,
) -> usize {
    if src.is_empty() || closes.is_empty() || pivot_lows.is_empty() {
        return 0;
    }
    // Confirmation gate: the newest bar must continue upward in either the
    // indicator or the price before a bullish call is allowed.
    let (Some(src0), Some(src1), Some(close0), Some(close1)) = (
        series::series_at(src, 0),
        series::series_at(src, 1),
        series::series_at(closes, 0),
        series::series_at(closes, 1),
    ) else {
        return 0;
    };
    if !(src0 > src1 || close0 > close1) {
        return 0;
    }

    let startpoint = 1;
    let last_idx = closes.len() - 1;
    for &(pivot_idx, pivot_val) in pivot_lows.iter().take(MAX_PIVOT_POINTS) {
        if pivot_idx == 0 {
            break;
        }
        let distance = last_idx - pivot_idx;
        if distance > MAX_BARS {
            break;
        }
        if distance <= 5 || distance <= startpoint {
            continue;
        }
        let (Some(src_start), Some(src_pivot), Some(close_start), Some(close_pivot)) = (
            series::series_at(src, startpoint),
            series::series_at(src, distance),
            series::series_at(closes, startpoint),
            series::series_at(closes, distance),
        ) else {
            continue;
        };
        if !pivot_val.is_finite() {
            continue;
        }
        let matches = match mode {
            ScanMode::Regular => src_start > src_pivot && close_start < pivot_val,
            ScanMode::Hidden => src_start < src_pivot && close_start > pivot_val,
        };
        if !matches {
            continue;
        }
        if envelope_holds(
            src, closes, src_start, src_pivot, close_start, close_pivot, startpoint, distance,
            true,
        ) {
            return distance;
        }
    }
    0
}

/// Mirror of [`bullish_scan`] against the pivot highs.
pub(crate) fn bearish_scan(
    src: &[f64],
    closes: &[f64],
    pivot_highs: &[(usize, f64)],
    mode: ScanMode,
) -> usize {
    if src.is_empty() || closes.is_empty() || pivot_highs.is_empty() {
        return 0;
    }
    let (Some(src0), Some(src1), Some(close0), Some(close1)) = (
        series::series_at(src, 0),
        series::series_at(src, 1),
        series::series_at(closes, 0),
        series::series_at(closes, 1),
    ) else {
        return 0;
    };
    if !(src0 < src1 || close0 < close1) {
        return 0;
    }

    let startpoint = 1;
    let last_idx = closes.len() - 1;
    for &(pivot_idx, pivot_val) in pivot_highs.iter().take(MAX_PIVOT_POINTS) {
        if pivot_idx == 0 {
            break;
        }
        let distance = last_idx - pivot_idx;
        if distance > MAX_BARS {
            break;
        }
        if distance <= 5 || distance <= startpoint {
            continue;
        }
        let (Some(src_start), Some(src_pivot), Some(close_start), Some(close_pivot)) = (
            series::series_at(src, startpoint),
            series::series_at(src, distance),
            series::series_at(closes, startpoint),
            series::series_at(closes, distance),
        ) else {
            continue;
        };
        if !pivot_val.is_finite() {
            continue;
        }
        let matches = match mode {
            ScanMode::Regular => src_start < src_pivot && close_start > pivot_val,
            ScanMode::Hidden => src_start > src_pivot && close_start < pivot_val,
        };
        if !matches {
            continue;
        }
        if envelope_holds(
            src, closes, src_start, src_pivot, close_start, close_pivot, startpoint, distance,
            false,
        ) {
            return distance;
        }
    }
    0
}

/// Replays the linear interpolation from the current bar back to the pivot.
/// For a bullish candidate every intermediate bar must hold at or above both
/// lines; for a bearish one at or below.
#[allow(clippy::too_many_arguments)]
fn envelope_holds(
    src: &[f64],
    closes: &[f64],
    src_start: f64,
    src_pivot: f64,
    close_start: f64,
    close_pivot: f64,
    startpoint: usize,
    distance: usize,
    bullish: bool,
) -> bool {
    let steps = (distance - startpoint) as f64;
    let src_slope = (src_start - src_pivot) / steps;
    let close_slope = (close_start - close_pivot) / steps;
    let mut src_line = src_start - src_slope;
    let mut close_line = close_start - close_slope;
    for bars_ago in (startpoint + 1)..distance {
        let (Some(src_v), Some(close_v)) = (
            series::series_at(src, bars_ago),
            series::series_at(closes, bars_ago),
        ) else {
            return false;
        };
        let violated = if bullish {
            src_v < src_line || close_v < close_line
        } else {
            src_v > src_line || close_v > close_line
        };
        if violated {
            return false;
        }
        src_line -= src_slope;
        close_line -= close_slope;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 80 bars shaped so index 19 is the only pivot low (value 100) and the
    /// final close (98) undercuts it while an indicator holds a higher low.
    fn pivot_low_fixture() -> (Vec<f64>, Vec<f64>) {
        let mut closes = vec![0.0; 80];
        for (i, c) in closes.iter_mut().enumerate().take(19) {
            *c = 104.0 - 0.2 * i as f64;
        }
        closes[19] = 100.0;
        for i in 20..=45 {
            closes[i] = 100.5 + 3.5 * (i - 20) as f64 / 25.0;
        }
        for i in 46..=77 {
            closes[i] = 104.0 - 4.8 * (i - 45) as f64 / 32.0;
        }
        closes[78] = 98.0;
        closes[79] = 98.5;

        let mut ind = vec![25.0; 80];
        ind[19] = 20.0;
        for v in ind.iter_mut().take(78).skip(20) {
            *v = 35.0;
        }
        ind[78] = 30.0;
        ind[79] = 30.5;
        (closes, ind)
    }

    #[test]
    fn collect_pivots_finds_strict_extrema_newest_first() {
        let (closes, _) = pivot_low_fixture();
        let lows = collect_pivots(&closes, PIVOT_PERIOD, false, MAX_PIVOT_POINTS);
        assert_eq!(lows.len(), 1);
        assert_eq!(lows[0], (19, 100.0));
        let highs = collect_pivots(&closes, PIVOT_PERIOD, true, MAX_PIVOT_POINTS);
        assert_eq!(highs[0].0, 45);
    }

    #[test]
    fn pivot_requires_strict_extremum() {
        let flat = vec![5.0; 20];
        assert!(collect_pivots(&flat, PIVOT_PERIOD, false, 10).is_empty());
        assert!(collect_pivots(&flat, PIVOT_PERIOD, true, 10).is_empty());
    }

    #[test]
    fn regular_bullish_divergence_at_distance_60() {
        let (closes, ind) = pivot_low_fixture();
        let lows = collect_pivots(&closes, PIVOT_PERIOD, false, MAX_PIVOT_POINTS);
        let distance = bullish_scan(&ind, &closes, &lows, ScanMode::Regular);
        assert_eq!(distance, 60);
        // The same shape is not a hidden divergence.
        assert_eq!(bullish_scan(&ind, &closes, &lows, ScanMode::Hidden), 0);
    }

    #[test]
    fn envelope_penetration_kills_the_signal() {
        let (closes, mut ind) = pivot_low_fixture();
        // Drop one intermediate indicator bar far below the pivot->now line.
        ind[50] = 5.0;
        let lows = collect_pivots(&closes, PIVOT_PERIOD, false, MAX_PIVOT_POINTS);
        assert_eq!(bullish_scan(&ind, &closes, &lows, ScanMode::Regular), 0);
    }

    #[test]
    fn confirmation_gate_blocks_fading_moves() {
        let (mut closes, mut ind) = pivot_low_fixture();
        // Current bar turns down in both indicator and price.
        closes[79] = 97.5;
        ind[79] = 29.0;
        let lows = collect_pivots(&closes, PIVOT_PERIOD, false, MAX_PIVOT_POINTS);
        assert_eq!(bullish_scan(&ind, &closes, &lows, ScanMode::Regular), 0);
    }

    #[test]
    fn pivots_closer_than_six_bars_are_skipped() {
        let mut closes = vec![100.0; 20];
        // Strict pivot low at index 16, distance 3 from the end.
        for (i, c) in closes.iter_mut().enumerate() {
            *c = 100.0 + (i as f64) * 0.01;
        }
        closes[16] = 90.0;
        closes[19] = 89.0;
        let lows = collect_pivots(&closes, 2, false, 10);
        assert!(lows.iter().any(|&(idx, _)| idx == 16));
        let ind: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(bullish_scan(&ind, &closes, &lows, ScanMode::Regular), 0);
    }

    #[test]
    fn window_too_short_yields_nothing() {
        let candles: Vec<Candle> = Vec::new();
        assert!(compute_signals(&candles, true).is_empty());
    }

    #[test]
    fn rsi_series_excluded_when_disabled() {
        let candles = crate::engine::tests::window(240);
        let with_rsi = compute_signals(&candles, true);
        let without = compute_signals(&candles, false);
        assert!(without.iter().all(|s| s.indicator != "rsi"));
        // Disabling rsi must not invent signals elsewhere.
        assert!(without.len() <= with_rsi.len());
    }

    #[test]
    fn all_signal_distances_respect_bounds() {
        let candles = crate::engine::tests::window(240);
        for signal in compute_signals(&candles, true) {
            assert!(signal.distance > 5 && signal.distance <= MAX_BARS);
        }
    }
}
