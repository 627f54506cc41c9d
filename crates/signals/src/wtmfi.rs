//! WaveTrend + money-flow hybrid oscillator.
//!
//! A channel-normalized WaveTrend line is blended with a scaled MFI, then
//! post-processed into a bounded, quantized oscillator so downstream
//! comparisons never fight sub-step noise.

use crate::series;
use helmsman_core::IndicatorConfig;

const POST_MULTIPLIER: f64 = 1.2;
const OSC_MAX: f64 = 60.0;
const OSC_MIN: f64 = -60.0;
const STEP_SIZE: f64 = 6.6;
const ALMA_OFFSET: f64 = 0.85;
const ALMA_SIGMA: f64 = 6.0;

/// Parameters for the hybrid oscillator, normalized so zero/absent values
/// take the production defaults.
#[derive(Debug, Clone, Copy)]
pub struct WtMfiSettings {
    pub channel_len: usize,
    pub avg_len: usize,
    pub smooth_len: usize,
    pub mfi_len: usize,
    pub wt_weight: f64,
    pub mfi_scale: f64,
    pub overbought: f64,
    pub oversold: f64,
}

impl Default for WtMfiSettings {
    fn default() -> Self {
        Self {
            channel_len: 10,
            avg_len: 8,
            smooth_len: 5,
            mfi_len: 10,
            wt_weight: 0.3,
            mfi_scale: 1.5,
            overbought: 50.0,
            oversold: -50.0,
        }
    }
}

impl WtMfiSettings {
    #[must_use]
    pub fn from_config(cfg: &IndicatorConfig) -> Self {
        let d = Self::default();
        Self {
            channel_len: if cfg.wt_channel_len == 0 { d.channel_len } else { cfg.wt_channel_len },
            avg_len: if cfg.wt_avg_len == 0 { d.avg_len } else { cfg.wt_avg_len },
            smooth_len: if cfg.wt_smooth_len == 0 { d.smooth_len } else { cfg.wt_smooth_len },
            mfi_len: if cfg.mfi_len == 0 { d.mfi_len } else { cfg.mfi_len },
            wt_weight: if cfg.wt_weight <= 0.0 { d.wt_weight } else { cfg.wt_weight },
            mfi_scale: if cfg.mfi_scale <= 0.0 { d.mfi_scale } else { cfg.mfi_scale },
            overbought: if cfg.wt_overbought == 0.0 { d.overbought } else { cfg.wt_overbought },
            oversold: if cfg.wt_oversold == 0.0 { d.oversold } else { cfg.wt_oversold },
        }
    }
}

/// Raw hybrid series before post-processing. The warm-up region (longest
/// constituent lookback plus one) is masked to NaN.
#[must_use]
pub fn hybrid_series(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    volumes: &[f64],
    settings: WtMfiSettings,
) -> Vec<f64> {
    let n = closes.len();
    if n == 0 {
        return Vec::new();
    }
    let tp: Vec<f64> = (0..n).map(|i| (highs[i] + lows[i] + closes[i]) / 3.0).collect();
    let esa = series::ema(&tp, settings.channel_len);
    let abs_diff: Vec<f64> = (0..n).map(|i| (tp[i] - esa[i]).abs()).collect();
    let d = series::ema(&abs_diff, settings.channel_len);
    let ci: Vec<f64> = (0..n)
        .map(|i| {
            let denom = 0.015 * d[i];
            if denom == 0.0 { 0.0 } else { (tp[i] - esa[i]) / denom }
        })
        .collect();
    let wt1 = series::ema(&ci, settings.avg_len);
    let wt2 = series::alma(&wt1, settings.smooth_len, ALMA_OFFSET, ALMA_SIGMA);
    let mfi = series::mfi(highs, lows, closes, volumes, settings.mfi_len);

    let mut hybrid: Vec<f64> = (0..n)
        .map(|i| {
            let mfi_scaled = (mfi[i] - 50.0) * settings.mfi_scale;
            let wt = if wt2[i].is_finite() { wt2[i] } else { 0.0 };
            settings.wt_weight * wt + (1.0 - settings.wt_weight) * mfi_scaled
        })
        .collect();

    let required = settings
        .channel_len
        .max(settings.avg_len)
        .max(settings.smooth_len)
        .max(settings.mfi_len)
        + 1;
    for value in hybrid.iter_mut().take(required.min(n)) {
        *value = f64::NAN;
    }
    hybrid
}

/// Post-processing: amplify, smooth with ALMA, clamp to the oscillator
/// bounds and quantize to the step grid. Quantization lives here, in the
/// producer, so consumers can compare values exactly.
#[must_use]
pub fn post_process(series_in: &[f64], smooth_len: usize) -> Vec<f64> {
    if series_in.is_empty() {
        return Vec::new();
    }
    let smooth_len = if smooth_len == 0 { 5 } else { smooth_len };
    let amplified: Vec<f64> = series_in
        .iter()
        .map(|v| if v.is_finite() { v * POST_MULTIPLIER } else { f64::NAN })
        .collect();
    let smoothed = series::alma(&amplified, smooth_len, ALMA_OFFSET, ALMA_SIGMA);
    smoothed
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if i + 1 < smooth_len || !v.is_finite() || !amplified[i].is_finite() {
                return f64::NAN;
            }
            let clamped = series::clamp(v, OSC_MIN, OSC_MAX);
            series::clamp(series::quantize_step(clamped, STEP_SIZE), OSC_MIN, OSC_MAX)
        })
        .collect()
}

/// Full pipeline from candle components to the bounded oscillator.
#[must_use]
pub fn compute(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    volumes: &[f64],
    settings: WtMfiSettings,
) -> Vec<f64> {
    post_process(&hybrid_series(highs, lows, closes, volumes, settings), settings.smooth_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let closes: Vec<f64> = (0..n)
            .map(|i| 100.0 + 5.0 * ((i as f64) * 0.25).sin())
            .collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.0).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 1.0).collect();
        let volumes: Vec<f64> = (0..n).map(|i| 50.0 + (i % 7) as f64).collect();
        (highs, lows, closes, volumes)
    }

    #[test]
    fn output_is_bounded_and_quantized() {
        let (highs, lows, closes, volumes) = synthetic(120);
        let out = compute(&highs, &lows, &closes, &volumes, WtMfiSettings::default());
        assert_eq!(out.len(), 120);
        for &v in out.iter().filter(|v| v.is_finite()) {
            assert!((-60.0..=60.0).contains(&v), "out of bounds: {v}");
            let steps = v / 6.6;
            assert!((steps - steps.round()).abs() < 1e-6, "not on step grid: {v}");
        }
        // Something finite must come out of a 120-bar window.
        assert!(out.iter().any(|v| v.is_finite()));
    }

    #[test]
    fn warmup_region_is_masked() {
        let (highs, lows, closes, volumes) = synthetic(40);
        let hybrid = hybrid_series(&highs, &lows, &closes, &volumes, WtMfiSettings::default());
        // channel 10 / avg 8 / smooth 5 / mfi 10 -> first 11 bars undefined.
        assert!(hybrid[..11].iter().all(|v| v.is_nan()));
        assert!(hybrid[11..].iter().any(|v| v.is_finite()));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(compute(&[], &[], &[], &[], WtMfiSettings::default()).is_empty());
    }

    #[test]
    fn settings_normalize_zeroes_to_defaults() {
        let cfg = IndicatorConfig {
            wt_channel_len: 0,
            wt_weight: 0.0,
            ..IndicatorConfig::default()
        };
        let s = WtMfiSettings::from_config(&cfg);
        assert_eq!(s.channel_len, 10);
        assert!((s.wt_weight - 0.3).abs() < 1e-12);
    }
}
