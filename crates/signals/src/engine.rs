//! Window indicator computation: one report per (symbol, interval) window.

use crate::series;
use crate::wtmfi::{self, WtMfiSettings};
use anyhow::{bail, Result};
use helmsman_core::{Candle, IndicatorConfig};
use serde::Serialize;
use std::collections::HashMap;

/// One computed indicator: latest value, sanitized series and a qualitative
/// state label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndicatorValue {
    pub latest: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub symbol: String,
    pub interval: String,
    pub count: usize,
    pub values: HashMap<String, IndicatorValue>,
}

pub(crate) fn extract_series(candles: &[Candle]) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let closes = candles.iter().map(|c| c.close).collect();
    let highs = candles.iter().map(|c| c.high).collect();
    let lows = candles.iter().map(|c| c.low).collect();
    let volumes = candles.iter().map(|c| c.volume).collect();
    (closes, highs, lows, volumes)
}

/// Computes the full indicator set over the candle window.
///
/// # Errors
/// Fails on an empty window.
pub fn compute_report(
    symbol: &str,
    interval: &str,
    candles: &[Candle],
    cfg: &IndicatorConfig,
) -> Result<Report> {
    if candles.is_empty() {
        bail!("no candles for {symbol} {interval}");
    }
    let (closes, highs, lows, volumes) = extract_series(candles);
    let last_close = closes[closes.len() - 1];
    let mut values = HashMap::new();

    let ema_periods = [
        ("ema_fast", cfg.ema_fast.max(1)),
        ("ema_mid", cfg.ema_mid.max(1)),
        ("ema_slow", cfg.ema_slow.max(1)),
        ("ema_long", cfg.ema_long.max(1)),
    ];
    for (name, period) in ema_periods {
        let ema = series::trim_leading_zeros(&series::sanitize(&series::ema(&closes, period)));
        let latest = series::last_valid(&ema);
        values.insert(
            name.to_string(),
            IndicatorValue {
                latest,
                series: ema,
                state: relative_state(last_close, latest).to_string(),
                note: format!("EMA{period} vs price"),
            },
        );
    }

    if cfg.rsi_enabled {
        let rsi_series = series::sanitize(&series::rsi(&closes, 14));
        let latest = series::last_valid(&rsi_series);
        let state = if latest >= 70.0 {
            "overbought"
        } else if latest <= 30.0 {
            "oversold"
        } else {
            "neutral"
        };
        values.insert(
            "rsi".to_string(),
            IndicatorValue {
                latest,
                series: rsi_series,
                state: state.to_string(),
                note: "period=14 thresholds=30.0/70.0".to_string(),
            },
        );
    }

    let (macd_line, macd_signal, macd_hist) = series::macd(&closes, 12, 26, 9);
    let line = series::sanitize(&macd_line);
    let signal = series::sanitize(&macd_signal);
    let hist = series::sanitize(&macd_hist);
    values.insert(
        "macd".to_string(),
        IndicatorValue {
            latest: series::last_valid(&line),
            series: hist.clone(),
            state: polarity_state(series::last_valid(&hist)).to_string(),
            note: format!(
                "signal={:.4} hist={:.4}",
                series::last_valid(&signal),
                series::last_valid(&hist)
            ),
        },
    );

    let roc_series = series::sanitize(&series::roc(&closes, 9));
    let roc_latest = series::last_valid(&roc_series);
    values.insert(
        "roc".to_string(),
        IndicatorValue {
            latest: roc_latest,
            series: roc_series,
            state: polarity_state(roc_latest).to_string(),
            note: "period=9".to_string(),
        },
    );

    let stoch = series::sanitize(&series::sma(
        &series::stoch_fast_k(&closes, &highs, &lows, 14),
        3,
    ));
    let stoch_latest = series::last_valid(&stoch);
    values.insert(
        "stoch_k".to_string(),
        IndicatorValue {
            latest: stoch_latest,
            series: stoch,
            state: stochastic_state(stoch_latest).to_string(),
            note: "fast %K smoothed 3".to_string(),
        },
    );

    let will = series::sanitize(&series::williams_r(&highs, &lows, &closes, 14));
    let will_latest = series::last_valid(&will);
    values.insert(
        "williams_r".to_string(),
        IndicatorValue {
            latest: will_latest,
            series: will,
            state: stochastic_state(-will_latest).to_string(),
            note: "period=14".to_string(),
        },
    );

    let atr_series = series::sanitize(&series::atr(&highs, &lows, &closes, 14));
    values.insert(
        "atr".to_string(),
        IndicatorValue {
            latest: series::last_valid(&atr_series),
            series: atr_series,
            state: "volatility".to_string(),
            note: "period=14".to_string(),
        },
    );

    let obv_series = series::sanitize(&series::obv(&closes, &volumes));
    values.insert(
        "obv".to_string(),
        IndicatorValue {
            latest: series::last_valid(&obv_series),
            series: obv_series,
            state: polarity_state(roc_latest).to_string(),
            note: "volume thrust".to_string(),
        },
    );

    if let Some(z) = series::zscore_last(&volumes) {
        values.insert(
            "volume_z".to_string(),
            IndicatorValue {
                latest: series::round4(z),
                state: polarity_state(z).to_string(),
                note: format!("window={}", volumes.len()),
                ..IndicatorValue::default()
            },
        );
    }

    let wt_settings = WtMfiSettings::from_config(cfg);
    let wt_series = series::sanitize(&wtmfi::compute(
        &highs,
        &lows,
        &closes,
        &volumes,
        wt_settings,
    ));
    if !wt_series.is_empty() {
        let latest = series::last_valid(&wt_series);
        let state = if latest >= wt_settings.overbought {
            "overbought"
        } else if latest <= wt_settings.oversold {
            "oversold"
        } else {
            "neutral"
        };
        values.insert(
            "wt_mfi_hybrid".to_string(),
            IndicatorValue {
                latest,
                series: wt_series,
                state: state.to_string(),
                note: format!(
                    "len={}/{}/{} mfi={} wt={:.2} scale={:.2}",
                    wt_settings.channel_len,
                    wt_settings.avg_len,
                    wt_settings.smooth_len,
                    wt_settings.mfi_len,
                    wt_settings.wt_weight,
                    wt_settings.mfi_scale
                ),
            },
        );
    }

    Ok(Report {
        symbol: symbol.to_uppercase(),
        interval: interval.to_lowercase(),
        count: candles.len(),
        values,
    })
}

/// ATR series helper used when registering divergence validations.
///
/// # Errors
/// Fails on an empty window or an all-warmup result.
pub fn compute_atr_series(candles: &[Candle], period: usize) -> Result<Vec<f64>> {
    if candles.is_empty() {
        bail!("no candles");
    }
    let period = if period == 0 { 14 } else { period };
    let (closes, highs, lows, _) = extract_series(candles);
    let out = series::sanitize(&series::atr(&highs, &lows, &closes, period));
    if out.is_empty() {
        bail!("atr series empty");
    }
    Ok(out)
}

/// Price relative to a reference with a ±0.2% deadband.
fn relative_state(price: f64, reference: f64) -> &'static str {
    if reference == 0.0 {
        return "unknown";
    }
    if price > reference * 1.002 {
        "above"
    } else if price < reference * 0.998 {
        "below"
    } else {
        "touch"
    }
}

fn polarity_state(v: f64) -> &'static str {
    if v > 0.0 {
        "positive"
    } else if v < 0.0 {
        "negative"
    } else {
        "flat"
    }
}

fn stochastic_state(v: f64) -> &'static str {
    if v >= 80.0 {
        "overbought"
    } else if v <= 20.0 {
        "oversold"
    } else {
        "neutral"
    }
}
