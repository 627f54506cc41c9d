//! Cumulative volume delta over a candle window.

use helmsman_core::Candle;
use serde::Serialize;

/// Snapshot of taker-flow pressure across the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvdMetrics {
    /// Cumulative sum of (taker buy - taker sell) across the window.
    pub value: f64,
    /// Value minus the value 6 bars ago; zero when the window is shorter.
    pub momentum: f64,
    /// Position of the final value inside the series range; 0.5 when flat.
    pub normalized: f64,
    /// `down` if price rises while CVD falls vs 6 bars ago, `up` for the
    /// mirror case, else `neutral`.
    pub divergence: String,
    /// `local_top` / `local_bottom` when the last three values form a peak
    /// or trough, else `none`.
    pub peak_flip: String,
}

/// Computes the CVD snapshot; `None` on an empty window.
#[must_use]
pub fn compute_cvd(candles: &[Candle]) -> Option<CvdMetrics> {
    if candles.is_empty() {
        return None;
    }
    let mut cvd = Vec::with_capacity(candles.len());
    let mut cumulative = 0.0;
    for c in candles {
        cumulative += c.taker_buy_volume - c.taker_sell_volume;
        cvd.push(cumulative);
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let last = cvd[cvd.len() - 1];
    let momentum = if cvd.len() > 6 {
        last - cvd[cvd.len() - 6]
    } else {
        0.0
    };

    let min = cvd.iter().copied().fold(f64::INFINITY, f64::min);
    let max = cvd.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let normalized = if max > min { (last - min) / (max - min) } else { 0.5 };

    let (price_prev, cvd_prev) = if closes.len() > 6 {
        (closes[closes.len() - 6], cvd[cvd.len() - 6])
    } else {
        (closes[0], cvd[0])
    };
    let price_now = closes[closes.len() - 1];
    let divergence = if price_now > price_prev && last < cvd_prev {
        "down"
    } else if price_now < price_prev && last > cvd_prev {
        "up"
    } else {
        "neutral"
    };

    let peak_flip = if cvd.len() > 3 {
        let a = cvd[cvd.len() - 1];
        let b = cvd[cvd.len() - 2];
        let c = cvd[cvd.len() - 3];
        if a < b && b > c {
            "local_top"
        } else if a > b && b < c {
            "local_bottom"
        } else {
            "none"
        }
    } else {
        "none"
    };

    Some(CvdMetrics {
        value: last,
        momentum,
        normalized,
        divergence: divergence.to_string(),
        peak_flip: peak_flip.to_string(),
    })
}
