use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// Parses the broker's lowercase side string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

/// Lifecycle of a broker position as tracked locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Partial,
    ClosingPartial,
    ClosingFull,
    Closed,
}

impl PositionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Partial => "partial",
            Self::ClosingPartial => "closing_partial",
            Self::ClosingFull => "closing_full",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "open" => Some(Self::Open),
            "partial" => Some(Self::Partial),
            "closing_partial" => Some(Self::ClosingPartial),
            "closing_full" => Some(Self::ClosingFull),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether the position is eligible for exit evaluation.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Partial)
    }

    /// Valid transitions. Anything not listed here is a bug in the caller;
    /// in particular there is no path out of `Closed`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open | Self::Partial, Self::ClosingPartial | Self::ClosingFull)
                | (Self::ClosingPartial, Self::Partial)
                | (Self::ClosingPartial | Self::ClosingFull, Self::Closed)
        )
    }
}

/// Locally tracked view of a broker position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trade_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub initial_amount: f64,
    pub current_amount: f64,
    pub closed_amount: f64,
    pub stake: f64,
    pub leverage: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Fraction of the initial quantity still open.
    #[must_use]
    pub fn remaining_ratio(&self) -> f64 {
        if self.initial_amount > 0.0 {
            self.current_amount / self.initial_amount
        } else {
            0.0
        }
    }
}

/// Pre-planned exit levels for one position: stop loss, take profit and up
/// to three partial-exit tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRecord {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub tier1_price: f64,
    pub tier1_ratio: f64,
    pub tier1_done: bool,
    pub tier2_price: f64,
    pub tier2_ratio: f64,
    pub tier2_done: bool,
    pub tier3_price: f64,
    pub tier3_ratio: f64,
    pub tier3_done: bool,
    pub remaining_ratio: f64,
    pub is_placeholder: bool,
}

impl Default for TierRecord {
    fn default() -> Self {
        Self {
            stop_loss: 0.0,
            take_profit: 0.0,
            tier1_price: 0.0,
            tier1_ratio: 0.0,
            tier1_done: false,
            tier2_price: 0.0,
            tier2_ratio: 0.0,
            tier2_done: false,
            tier3_price: 0.0,
            tier3_ratio: 0.0,
            tier3_done: false,
            remaining_ratio: 1.0,
            is_placeholder: false,
        }
    }
}

/// One partial-exit tier viewed positionally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tier {
    pub name: TierName,
    pub price: f64,
    pub ratio: f64,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Tier1,
    Tier2,
    Tier3,
}

impl TierName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
            Self::Tier3 => "tier3",
        }
    }
}

impl TierRecord {
    /// Tiers in trigger order.
    #[must_use]
    pub const fn tiers(&self) -> [Tier; 3] {
        [
            Tier {
                name: TierName::Tier1,
                price: self.tier1_price,
                ratio: self.tier1_ratio,
                done: self.tier1_done,
            },
            Tier {
                name: TierName::Tier2,
                price: self.tier2_price,
                ratio: self.tier2_ratio,
                done: self.tier2_done,
            },
            Tier {
                name: TierName::Tier3,
                price: self.tier3_price,
                ratio: self.tier3_ratio,
                done: self.tier3_done,
            },
        ]
    }

    /// A tier is usable when both its price and its ratio are set.
    #[must_use]
    pub fn has_complete_tier(&self) -> bool {
        self.tiers().iter().any(|t| t.price > 0.0 && t.ratio > 0.0)
    }

    pub fn mark_done(&mut self, name: TierName) {
        match name {
            TierName::Tier1 => self.tier1_done = true,
            TierName::Tier2 => self.tier2_done = true,
            TierName::Tier3 => self.tier3_done = true,
        }
    }

    pub fn mark_all_done(&mut self) {
        self.tier1_done = true;
        self.tier2_done = true;
        self.tier3_done = true;
    }
}

/// What caused an exit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    StopLoss,
    TakeProfit,
    Tier(TierName),
}

impl ExitKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Tier(name) => name.as_str(),
        }
    }

    /// Stop loss and take profit always flatten the whole position.
    #[must_use]
    pub const fn is_full_close(self) -> bool {
        matches!(self, Self::StopLoss | Self::TakeProfit)
    }
}

/// State of an issued exit awaiting broker confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingExitState {
    Queued,
    InFlight,
    Acked,
}

/// Controller-side marker that an exit has been issued for a trade and is
/// awaiting the broker's fill webhook. At most one exists per trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    pub trade_id: i64,
    pub symbol: String,
    pub side: Side,
    pub kind: ExitKind,
    /// Every tier folded into this single exit request, nearest first.
    pub covered_tiers: Vec<TierName>,
    pub target_price: f64,
    pub effective_ratio: f64,
    pub prev_amount: f64,
    pub prev_closed: f64,
    pub initial_amount: f64,
    pub target_amount: f64,
    pub expected_amount: f64,
    pub requested_at: DateTime<Utc>,
    pub state: PendingExitState,
    pub force_full: bool,
    pub operation_tag: OperationKind,
}

/// A position joined with its exit levels, as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionWithTiers {
    pub position: Position,
    pub tiers: TierRecord,
}

/// Row kind for the trade operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Entry,
    StopLoss,
    TakeProfit,
    Tier1,
    Tier2,
    Tier3,
    Failed,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Tier1 => "tier1",
            Self::Tier2 => "tier2",
            Self::Tier3 => "tier3",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn for_exit(kind: ExitKind) -> Self {
        match kind {
            ExitKind::StopLoss => Self::StopLoss,
            ExitKind::TakeProfit => Self::TakeProfit,
            ExitKind::Tier(TierName::Tier1) => Self::Tier1,
            ExitKind::Tier(TierName::Tier2) => Self::Tier2,
            ExitKind::Tier(TierName::Tier3) => Self::Tier3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_state_diagram() {
        use PositionStatus::*;
        let legal = [
            (Open, ClosingPartial),
            (Open, ClosingFull),
            (Partial, ClosingPartial),
            (Partial, ClosingFull),
            (ClosingPartial, Partial),
            (ClosingPartial, Closed),
            (ClosingFull, Closed),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{from:?} -> {to:?} should be legal");
        }
        // No way back out of closed, and no closing -> open.
        for next in [Open, Partial, ClosingPartial, ClosingFull] {
            assert!(!Closed.can_transition_to(next));
        }
        assert!(!ClosingFull.can_transition_to(Open));
        assert!(!ClosingPartial.can_transition_to(Open));
    }

    #[test]
    fn remaining_ratio_zero_when_initial_zero() {
        let p = Position {
            trade_id: 1,
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            initial_amount: 0.0,
            current_amount: 0.0,
            closed_amount: 0.0,
            stake: 0.0,
            leverage: 1.0,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
        };
        assert_eq!(p.remaining_ratio(), 0.0);
    }

    #[test]
    fn tier_completeness_requires_price_and_ratio() {
        let mut t = TierRecord::default();
        assert!(!t.has_complete_tier());
        t.tier2_price = 2875.0;
        assert!(!t.has_complete_tier());
        t.tier2_ratio = 0.3;
        assert!(t.has_complete_tier());
    }

    #[test]
    fn exit_kind_labels() {
        assert_eq!(ExitKind::StopLoss.as_str(), "stop_loss");
        assert_eq!(ExitKind::Tier(TierName::Tier3).as_str(), "tier3");
        assert!(ExitKind::TakeProfit.is_full_close());
        assert!(!ExitKind::Tier(TierName::Tier1).is_full_close());
    }
}
