//! Primitive series math over close/high/low/volume arrays.
//!
//! Warm-up conventions follow the common TA library behavior the rest of the
//! crate is calibrated against: smoothed averages emit `0.0` during their
//! lookback, window functions emit `NaN`. Callers either sanitize or mask
//! the warm-up region explicitly.

/// Rounds to 4 decimal places, the precision every exported value uses.
#[must_use]
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[must_use]
pub fn clamp(v: f64, min: f64, max: f64) -> f64 {
    v.max(min).min(max)
}

/// Drops NaN/Inf entries and rounds the survivors.
#[must_use]
pub fn sanitize(series: &[f64]) -> Vec<f64> {
    series
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(round4)
        .collect()
}

/// Last finite entry, or zero when none exists.
#[must_use]
pub fn last_valid(series: &[f64]) -> f64 {
    series
        .iter()
        .rev()
        .copied()
        .find(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Strips the `0.0` warm-up prefix a smoothed average leaves behind.
#[must_use]
pub fn trim_leading_zeros(series: &[f64]) -> Vec<f64> {
    let start = series
        .iter()
        .position(|v| v.abs() > 1e-9)
        .unwrap_or(series.len());
    series[start..].to_vec()
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values; zero during the lookback.
#[must_use]
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![0.0; n];
    if period == 0 || n < period {
        return out;
    }
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let k = 2.0 / (period as f64 + 1.0);
    for i in period..n {
        out[i] = values[i] * k + out[i - 1] * (1.0 - k);
    }
    out
}

/// Simple moving average; NaN during the lookback and wherever the window
/// contains a non-finite value.
#[must_use]
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    if period <= 1 || n == 0 {
        return values.to_vec();
    }
    let mut out = vec![f64::NAN; n];
    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        if window.iter().all(|v| v.is_finite()) {
            out[i] = window.iter().sum::<f64>() / period as f64;
        }
    }
    out
}

/// Wilder RSI; zero during the lookback.
#[must_use]
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if period == 0 || n <= period {
        return out;
    }
    let mut gain = 0.0;
    let mut loss = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }
    let mut avg_gain = gain / period as f64;
    let mut avg_loss = loss / period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);
    for i in (period + 1)..n {
        let delta = closes[i] - closes[i - 1];
        let (g, l) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + g) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + l) / period as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain + avg_loss == 0.0 {
        50.0
    } else {
        100.0 * avg_gain / (avg_gain + avg_loss)
    }
}

/// MACD line, signal line and histogram for the given periods; zero during
/// each component's lookback.
#[must_use]
pub fn macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let mut line = vec![0.0; n];
    let mut signal = vec![0.0; n];
    let mut hist = vec![0.0; n];
    if n < slow {
        return (line, signal, hist);
    }
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);
    for i in (slow - 1)..n {
        line[i] = ema_fast[i] - ema_slow[i];
    }
    let sig = ema(&line[slow - 1..], signal_period);
    for (offset, value) in sig.iter().enumerate() {
        let i = slow - 1 + offset;
        if offset >= signal_period - 1 {
            signal[i] = *value;
            hist[i] = line[i] - signal[i];
        }
    }
    (line, signal, hist)
}

/// Wilder ATR from true ranges; zero during the lookback.
#[must_use]
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if period == 0 || n <= period {
        return out;
    }
    let mut tr = vec![0.0; n];
    tr[0] = highs[0] - lows[0];
    for i in 1..n {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        tr[i] = hl.max(hc).max(lc);
    }
    let seed: f64 = tr[1..=period].iter().sum::<f64>() / period as f64;
    out[period] = seed;
    for i in (period + 1)..n {
        out[i] = (out[i - 1] * (period as f64 - 1.0) + tr[i]) / period as f64;
    }
    out
}

/// Fast stochastic %K over a rolling high/low window; NaN during lookback.
#[must_use]
pub fn stoch_fast_k(closes: &[f64], highs: &[f64], lows: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if period <= 1 || n == 0 {
        return out;
    }
    for i in 0..n {
        if i + 1 < period {
            out[i] = f64::NAN;
            continue;
        }
        let window_lo = lows[i + 1 - period..=i]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let window_hi = highs[i + 1 - period..=i]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let range = window_hi - window_lo;
        out[i] = if range == 0.0 {
            0.0
        } else {
            (closes[i] - window_lo) / range * 100.0
        };
    }
    out
}

/// On-balance volume: cumulative volume signed by close direction.
#[must_use]
pub fn obv(closes: &[f64], volumes: &[f64]) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if n == 0 {
        return out;
    }
    out[0] = volumes[0];
    for i in 1..n {
        out[i] = if closes[i] > closes[i - 1] {
            out[i - 1] + volumes[i]
        } else if closes[i] < closes[i - 1] {
            out[i - 1] - volumes[i]
        } else {
            out[i - 1]
        };
    }
    out
}

/// Money flow index over typical-price flows; zero during the lookback.
#[must_use]
pub fn mfi(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if period == 0 || n <= period {
        return out;
    }
    let tp: Vec<f64> = (0..n).map(|i| (highs[i] + lows[i] + closes[i]) / 3.0).collect();
    let mut pos = vec![0.0; n];
    let mut neg = vec![0.0; n];
    for i in 1..n {
        let flow = tp[i] * volumes[i];
        if tp[i] > tp[i - 1] {
            pos[i] = flow;
        } else if tp[i] < tp[i - 1] {
            neg[i] = flow;
        }
    }
    for i in period..n {
        let pos_sum: f64 = pos[i + 1 - period..=i].iter().sum();
        let neg_sum: f64 = neg[i + 1 - period..=i].iter().sum();
        out[i] = if pos_sum + neg_sum == 0.0 {
            50.0
        } else {
            100.0 * pos_sum / (pos_sum + neg_sum)
        };
    }
    out
}

/// Commodity channel index; zero during the lookback.
#[must_use]
pub fn cci(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if period <= 1 || n < period {
        return out;
    }
    let tp: Vec<f64> = (0..n).map(|i| (highs[i] + lows[i] + closes[i]) / 3.0).collect();
    for i in (period - 1)..n {
        let window = &tp[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let mean_dev = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
        out[i] = if mean_dev == 0.0 {
            0.0
        } else {
            (tp[i] - mean) / (0.015 * mean_dev)
        };
    }
    out
}

/// Momentum: difference to the value `period` bars ago; zero during lookback.
#[must_use]
pub fn mom(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    for i in period..n {
        out[i] = closes[i] - closes[i - period];
    }
    out
}

/// Rate of change in percent; zero during the lookback.
#[must_use]
pub fn roc(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    for i in period..n {
        if closes[i - period] != 0.0 {
            out[i] = (closes[i] / closes[i - period] - 1.0) * 100.0;
        }
    }
    out
}

/// Williams %R; NaN during the lookback.
#[must_use]
pub fn williams_r(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..n {
        let hi = highs[i + 1 - period..=i]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let lo = lows[i + 1 - period..=i]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let range = hi - lo;
        out[i] = if range == 0.0 { 0.0 } else { (hi - closes[i]) / range * -100.0 };
    }
    out
}

/// Volume-weighted moving average; NaN during the lookback or where the
/// window volume sums to zero.
#[must_use]
pub fn vwma(closes: &[f64], volumes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if period <= 1 || n == 0 {
        return out;
    }
    for i in 0..n {
        if i + 1 < period {
            out[i] = f64::NAN;
            continue;
        }
        let mut sum_pv = 0.0;
        let mut sum_v = 0.0;
        let mut valid = true;
        for j in i + 1 - period..=i {
            if !closes[j].is_finite() || !volumes[j].is_finite() {
                valid = false;
                break;
            }
            sum_pv += closes[j] * volumes[j];
            sum_v += volumes[j];
        }
        out[i] = if valid && sum_v != 0.0 {
            sum_pv / sum_v
        } else {
            f64::NAN
        };
    }
    out
}

/// Element-wise difference truncated to the shorter input; NaN where either
/// side is non-finite.
#[must_use]
pub fn diff(a: &[f64], b: &[f64]) -> Vec<f64> {
    let n = a.len().min(b.len());
    (0..n)
        .map(|i| {
            if a[i].is_finite() && b[i].is_finite() {
                a[i] - b[i]
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Chaikin money flow; NaN during the lookback.
#[must_use]
pub fn cmf(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if n == 0 || period <= 1 {
        return out;
    }
    let mut mfv = vec![0.0; n];
    for i in 0..n {
        let hl = highs[i] - lows[i];
        if hl != 0.0 {
            let multiplier = ((closes[i] - lows[i]) - (highs[i] - closes[i])) / hl;
            mfv[i] = multiplier * volumes[i];
        }
    }
    let mfv_sma = sma(&mfv, period);
    let vol_sma = sma(volumes, period);
    for i in 0..n {
        out[i] = if mfv_sma[i].is_finite() && vol_sma[i].is_finite() && vol_sma[i] != 0.0 {
            mfv_sma[i] / vol_sma[i]
        } else {
            f64::NAN
        };
    }
    out
}

/// Arnaud Legoux moving average. Weights are a Gaussian centered at
/// `offset * (length - 1)` with width `length / sigma`; the first
/// `length - 1` positions are undefined (NaN).
#[must_use]
pub fn alma(values: &[f64], length: usize, offset: f64, sigma: f64) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if length == 0 || n == 0 || sigma == 0.0 {
        return out;
    }
    let m = offset * (length as f64 - 1.0);
    let s = length as f64 / sigma;
    let denom = 2.0 * s * s;
    for i in 0..n {
        if i + 1 < length {
            continue;
        }
        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        for j in 0..length {
            let idx = i + 1 - length + j;
            let w = (-((j as f64 - m) * (j as f64 - m)) / denom).exp();
            sum += w * values[idx];
            weight_sum += w;
        }
        out[i] = if weight_sum == 0.0 { 0.0 } else { sum / weight_sum };
    }
    out
}

/// Quantizes to the nearest multiple of `step`, preserving sign.
#[must_use]
pub fn quantize_step(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    let steps = (v.abs() / step).round();
    steps * step * v.signum()
}

/// Z-score of the final value against the window mean and deviation.
#[must_use]
pub fn zscore_last(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    let std = var.sqrt();
    if std == 0.0 {
        return None;
    }
    Some((values[values.len() - 1] - mean) / std)
}

/// Highest and lowest finite values, rounded; zeros for an all-NaN series.
#[must_use]
pub fn bounds(series: &[f64]) -> (f64, f64) {
    let mut hi = f64::NEG_INFINITY;
    let mut lo = f64::INFINITY;
    for &v in series {
        if !v.is_finite() {
            continue;
        }
        hi = hi.max(v);
        lo = lo.min(v);
    }
    if hi == f64::NEG_INFINITY {
        (0.0, 0.0)
    } else {
        (round4(hi), round4(lo))
    }
}

/// Value `bars_ago` bars back from the series end, when finite.
#[must_use]
pub fn series_at(series: &[f64], bars_ago: usize) -> Option<f64> {
    let idx = series.len().checked_sub(1 + bars_ago)?;
    let v = series[idx];
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_sma_and_warms_up_with_zeros() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = ema(&values, 3);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 0.0);
        assert!((out[2] - 2.0).abs() < 1e-12);
        // k = 0.5: 4*0.5 + 2*0.5 = 3
        assert!((out[3] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rsi_is_100_for_monotone_rise() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&closes, 14);
        assert!((out[19] - 100.0).abs() < 1e-9);
        assert_eq!(out[13], 0.0);
    }

    #[test]
    fn stoch_k_hits_extremes() {
        let highs = vec![10.0; 20];
        let lows = vec![0.0; 20];
        let mut closes = vec![5.0; 20];
        closes[19] = 10.0;
        let out = stoch_fast_k(&closes, &highs, &lows, 14);
        assert!((out[19] - 100.0).abs() < 1e-9);
        assert!(out[5].is_nan());
    }

    #[test]
    fn obv_accumulates_by_direction() {
        let closes = [1.0, 2.0, 1.5, 1.5];
        let volumes = [10.0, 5.0, 3.0, 2.0];
        let out = obv(&closes, &volumes);
        assert_eq!(out, vec![10.0, 15.0, 12.0, 12.0]);
    }

    #[test]
    fn alma_first_len_minus_one_positions_are_nan() {
        let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let out = alma(&values, 5, 0.85, 6.0);
        assert!(out[..4].iter().all(|v| v.is_nan()));
        assert!(out[4..].iter().all(|v| v.is_finite()));
        // A constant series stays put.
        let flat = alma(&[3.0; 10], 5, 0.85, 6.0);
        assert!((flat[9] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn quantize_rounds_to_step_multiples() {
        assert!((quantize_step(10.0, 6.6) - 6.6).abs() < 1e-9);
        assert!((quantize_step(-10.0, 6.6) + 6.6).abs() < 1e-9);
        assert!((quantize_step(16.4, 6.6) - 13.2).abs() < 1e-9);
        assert_eq!(quantize_step(5.0, 0.0), 5.0);
    }

    #[test]
    fn sanitize_filters_and_rounds() {
        let out = sanitize(&[1.23456, f64::NAN, f64::INFINITY, 2.0]);
        assert_eq!(out, vec![1.2346, 2.0]);
    }

    #[test]
    fn macd_histogram_appears_after_signal_warmup() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let (line, signal, hist) = macd(&closes, 12, 26, 9);
        assert_eq!(line[24], 0.0);
        assert_ne!(line[30], 0.0);
        assert_eq!(signal[32], 0.0);
        assert_ne!(signal[40], 0.0);
        assert!((hist[40] - (line[40] - signal[40])).abs() < 1e-12);
    }

    #[test]
    fn vwma_matches_hand_computation() {
        let closes = [1.0, 2.0, 3.0];
        let volumes = [1.0, 1.0, 2.0];
        let out = vwma(&closes, &volumes, 2);
        assert!(out[0].is_nan());
        assert!((out[1] - 1.5).abs() < 1e-12);
        assert!((out[2] - (2.0 + 6.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn zscore_detects_volume_spike() {
        let mut volumes = vec![10.0; 30];
        volumes[29] = 100.0;
        let z = zscore_last(&volumes).unwrap();
        assert!(z > 3.0);
        assert!(zscore_last(&[5.0; 10]).is_none());
    }

    #[test]
    fn bounds_ignores_nan() {
        let (hi, lo) = bounds(&[f64::NAN, 2.0, -1.0, f64::INFINITY]);
        assert_eq!(hi, 2.0);
        assert_eq!(lo, -1.0);
    }

    #[test]
    fn series_at_indexes_from_the_end() {
        let s = [1.0, 2.0, 3.0];
        assert_eq!(series_at(&s, 0), Some(3.0));
        assert_eq!(series_at(&s, 2), Some(1.0));
        assert_eq!(series_at(&s, 3), None);
        assert_eq!(series_at(&[f64::NAN], 0), None);
    }
}
