//! Close-quantity arithmetic shared by exit paths.

/// Computes the quantity to close from a ratio.
///
/// With `from_initial` the ratio applies to the initial position size
/// (falling back to the current size when initial is unknown); otherwise it
/// applies to what is still open. The result is capped at the current
/// amount so a close can never exceed the open quantity.
#[must_use]
pub fn close_amount(current: f64, initial: f64, ratio: f64, from_initial: bool) -> f64 {
    if ratio <= 0.0 || current <= 0.0 {
        return 0.0;
    }
    let ratio = ratio.min(1.0);
    let base = if from_initial && initial > 0.0 {
        initial
    } else {
        current
    };
    ceil_to_decimals(base * ratio, 2).min(current)
}

/// Rounds up to the given number of decimal places. Venues truncate order
/// quantities downward, so rounding up avoids leaving dust behind.
#[must_use]
pub fn ceil_to_decimals(v: f64, decimals: u32) -> f64 {
    if decimals == 0 {
        return v.ceil();
    }
    let factor = 10f64.powi(decimals as i32);
    (v * factor).ceil() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_over_initial_caps_at_current() {
        // Half of the initial position, but only 0.3 is still open.
        assert_eq!(close_amount(0.3, 1.0, 0.5, true), 0.3);
        assert_eq!(close_amount(1.0, 1.0, 0.5, true), 0.5);
    }

    #[test]
    fn ratio_over_current_when_requested() {
        assert_eq!(close_amount(0.4, 1.0, 0.5, false), 0.2);
    }

    #[test]
    fn degenerate_inputs_close_nothing() {
        assert_eq!(close_amount(0.0, 1.0, 0.5, true), 0.0);
        assert_eq!(close_amount(1.0, 1.0, 0.0, true), 0.0);
        assert_eq!(close_amount(1.0, 1.0, -0.5, true), 0.0);
    }

    #[test]
    fn oversized_ratios_clamp_to_one() {
        assert_eq!(close_amount(1.0, 1.0, 2.0, true), 1.0);
    }

    #[test]
    fn rounding_is_upward_to_two_decimals() {
        // 0.333... rounds up to 0.34 rather than truncating to 0.33.
        let amount = close_amount(1.0, 1.0, 1.0 / 3.0, true);
        assert!((amount - 0.34).abs() < 1e-12);
        assert_eq!(ceil_to_decimals(1.001, 2), 1.01);
        assert_eq!(ceil_to_decimals(1.5, 0), 2.0);
    }
}
