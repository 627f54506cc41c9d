//! Price-level trigger predicates and the per-tick exit decision.

use helmsman_core::{ExitKind, PriceQuote, Side, TierName, TierRecord};

/// What a tick evaluation decided to do for one position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitPlan {
    pub kind: ExitKind,
    /// Tiers folded into this exit, nearest first. Empty for SL/TP.
    pub covered: Vec<TierName>,
    pub trigger_price: f64,
    pub ratio: f64,
    pub force_full: bool,
}

/// Stop loss sits on the losing side: a long stops out when price trades at
/// or below it, a short at or above. With `tick_confirm` only the last trade
/// price counts; otherwise the bar's extreme does.
#[must_use]
pub fn stop_loss_hit(side: Side, quote: &PriceQuote, stop: f64, tick_confirm: bool) -> bool {
    if stop <= 0.0 {
        return false;
    }
    let probe = |p: f64| p > 0.0;
    match side {
        Side::Long => {
            let reference = if tick_confirm { quote.last } else { low_or_last(quote) };
            probe(reference) && reference <= stop
        }
        Side::Short => {
            let reference = if tick_confirm { quote.last } else { high_or_last(quote) };
            probe(reference) && reference >= stop
        }
    }
}

/// Take profit and tiers sit on the winning side; symmetric to stop loss.
#[must_use]
pub fn target_hit(side: Side, quote: &PriceQuote, target: f64, tick_confirm: bool) -> bool {
    if target <= 0.0 {
        return false;
    }
    let probe = |p: f64| p > 0.0;
    match side {
        Side::Long => {
            let reference = if tick_confirm { quote.last } else { high_or_last(quote) };
            probe(reference) && reference >= target
        }
        Side::Short => {
            let reference = if tick_confirm { quote.last } else { low_or_last(quote) };
            probe(reference) && reference <= target
        }
    }
}

fn low_or_last(quote: &PriceQuote) -> f64 {
    if quote.low > 0.0 {
        quote.low
    } else {
        quote.last
    }
}

fn high_or_last(quote: &PriceQuote) -> f64 {
    if quote.high > 0.0 {
        quote.high
    } else {
        quote.last
    }
}

/// Evaluates one position's levels against a quote, in priority order:
/// stop loss, take profit, then the tier sweep.
///
/// The sweep walks tier1 -> tier2 -> tier3, skipping completed or invalid
/// tiers and stopping at the first valid tier the price did not reach (a
/// farther tier cannot have been reached either). All hit tiers coalesce
/// into a single plan whose kind is the last covered tier and whose ratio is
/// the sum, clamped to 1.
#[must_use]
pub fn evaluate(
    side: Side,
    quote: &PriceQuote,
    tiers: &TierRecord,
    tick_confirm: bool,
) -> Option<ExitPlan> {
    if stop_loss_hit(side, quote, tiers.stop_loss, tick_confirm) {
        return Some(ExitPlan {
            kind: ExitKind::StopLoss,
            covered: Vec::new(),
            trigger_price: quote.last,
            ratio: 1.0,
            force_full: true,
        });
    }
    if target_hit(side, quote, tiers.take_profit, tick_confirm) {
        return Some(ExitPlan {
            kind: ExitKind::TakeProfit,
            covered: Vec::new(),
            trigger_price: quote.last,
            ratio: 1.0,
            force_full: true,
        });
    }

    let mut covered = Vec::new();
    let mut ratio = 0.0;
    let mut last_price = 0.0;
    for tier in tiers.tiers() {
        if tier.done {
            continue;
        }
        if tier.price <= 0.0 || tier.ratio <= 0.0 {
            continue;
        }
        if !target_hit(side, quote, tier.price, tick_confirm) {
            break;
        }
        covered.push(tier.name);
        ratio += tier.ratio;
        last_price = tier.price;
    }
    let last = *covered.last()?;
    Some(ExitPlan {
        kind: ExitKind::Tier(last),
        covered,
        trigger_price: last_price,
        ratio: ratio.min(1.0),
        force_full: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(last: f64, high: f64, low: f64) -> PriceQuote {
        PriceQuote {
            symbol: "ETHUSDT".to_string(),
            last,
            high,
            low,
            updated_at: None,
        }
    }

    fn tiers() -> TierRecord {
        TierRecord {
            stop_loss: 2821.0,
            take_profit: 2900.0,
            tier1_price: 2850.0,
            tier1_ratio: 0.5,
            tier2_price: 2875.0,
            tier2_ratio: 0.3,
            tier3_price: 2900.0,
            tier3_ratio: 0.2,
            ..TierRecord::default()
        }
    }

    #[test]
    fn long_stop_loss_triggers_on_the_bar_low() {
        let q = quote(2821.5, 2822.0, 2820.9);
        assert!(stop_loss_hit(Side::Long, &q, 2821.0, false));
        // Tick-confirm mode needs the last price itself to cross.
        assert!(!stop_loss_hit(Side::Long, &q, 2821.0, true));
    }

    #[test]
    fn short_stop_loss_uses_the_bar_high() {
        let q = quote(2898.0, 2901.0, 2897.0);
        assert!(stop_loss_hit(Side::Short, &q, 2900.0, false));
        assert!(!stop_loss_hit(Side::Short, &q, 2902.0, false));
    }

    #[test]
    fn zero_levels_never_trigger() {
        let q = quote(2800.0, 2810.0, 2790.0);
        assert!(!stop_loss_hit(Side::Long, &q, 0.0, false));
        assert!(!target_hit(Side::Long, &q, 0.0, false));
    }

    #[test]
    fn stop_loss_takes_priority_over_everything() {
        // A bar wide enough to touch both the stop and tier1.
        let plan = evaluate(Side::Long, &quote(2820.0, 2851.0, 2819.0), &tiers(), false).unwrap();
        assert_eq!(plan.kind, ExitKind::StopLoss);
        assert!(plan.force_full);
        assert_eq!(plan.ratio, 1.0);
    }

    #[test]
    fn take_profit_forces_a_full_close() {
        let plan = evaluate(Side::Long, &quote(2905.0, 2905.0, 2899.0), &tiers(), false).unwrap();
        assert_eq!(plan.kind, ExitKind::TakeProfit);
        assert!(plan.force_full);
    }

    #[test]
    fn single_tier_hit_plans_a_partial() {
        let plan = evaluate(Side::Long, &quote(2851.0, 2855.0, 2850.0), &tiers(), false).unwrap();
        assert_eq!(plan.kind, ExitKind::Tier(TierName::Tier1));
        assert_eq!(plan.covered, vec![TierName::Tier1]);
        assert!((plan.ratio - 0.5).abs() < 1e-12);
        assert!(!plan.force_full);
        assert_eq!(plan.trigger_price, 2850.0);
    }

    #[test]
    fn simultaneous_tier_hits_coalesce_into_one_plan() {
        let plan = evaluate(Side::Long, &quote(2876.0, 2878.0, 2851.0), &tiers(), false).unwrap();
        assert_eq!(plan.kind, ExitKind::Tier(TierName::Tier2));
        assert_eq!(plan.covered, vec![TierName::Tier1, TierName::Tier2]);
        assert!((plan.ratio - 0.8).abs() < 1e-12);
        assert_eq!(plan.trigger_price, 2875.0);
    }

    #[test]
    fn sweep_stops_at_the_first_miss() {
        // Tier1 done; price reaches tier2 but not tier3.
        let mut t = tiers();
        t.tier1_done = true;
        t.take_profit = 0.0;
        let plan = evaluate(Side::Long, &quote(2876.0, 2878.0, 2860.0), &t, false).unwrap();
        assert_eq!(plan.covered, vec![TierName::Tier2]);
        assert!((plan.ratio - 0.3).abs() < 1e-12);
    }

    #[test]
    fn done_and_invalid_tiers_are_skipped_not_blocking() {
        let mut t = tiers();
        t.take_profit = 0.0;
        t.tier1_done = true;
        t.tier2_price = 0.0; // invalid, skipped
        let plan = evaluate(Side::Long, &quote(2901.0, 2902.0, 2890.0), &t, false).unwrap();
        assert_eq!(plan.kind, ExitKind::Tier(TierName::Tier3));
        assert_eq!(plan.covered, vec![TierName::Tier3]);
    }

    #[test]
    fn combined_ratio_clamps_to_one() {
        let mut t = tiers();
        t.take_profit = 0.0;
        t.tier1_ratio = 0.6;
        t.tier2_ratio = 0.6;
        let plan = evaluate(Side::Long, &quote(2876.0, 2878.0, 2850.0), &t, false).unwrap();
        assert_eq!(plan.ratio, 1.0);
    }

    #[test]
    fn no_hit_yields_no_plan() {
        assert!(evaluate(Side::Long, &quote(2840.0, 2845.0, 2835.0), &tiers(), false).is_none());
    }

    #[test]
    fn short_side_mirrors_the_comparisons() {
        let t = TierRecord {
            stop_loss: 2900.0,
            take_profit: 2700.0,
            tier1_price: 2800.0,
            tier1_ratio: 0.5,
            ..TierRecord::default()
        };
        let plan = evaluate(Side::Short, &quote(2799.0, 2805.0, 2798.0), &t, false).unwrap();
        assert_eq!(plan.kind, ExitKind::Tier(TierName::Tier1));
        let sl = evaluate(Side::Short, &quote(2899.0, 2901.0, 2898.0), &t, false).unwrap();
        assert_eq!(sl.kind, ExitKind::StopLoss);
    }
}
