//! Exit decisions produced by position evaluation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::decimal::Price;

/// Why a position was (or was explicitly not) acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Loss reached the hard loss-ratio floor.
    LossCircuitBreaker,
    /// Confidence or win probability collapsed against the lookback sample.
    ConfidenceDrop,
    /// Deep loss held on a strong rebound signal.
    SmartHold,
    /// Confidence fell below the level that justified the entry.
    EntryReasonExpired,
    /// Market trend turned against the position.
    CounterTrend,
    /// Stop-loss trailed toward the mark.
    TrailingTp,
    /// Part of a winning position closed to lock in profit.
    PartialProfitLock,
    /// Position held too long while losing.
    TimeBasedStop,
    /// Account margin usage too high; worst position closed.
    PortfolioProtection,
}

impl ExitReason {
    pub const ALL: [ExitReason; 9] = [
        Self::LossCircuitBreaker,
        Self::ConfidenceDrop,
        Self::SmartHold,
        Self::EntryReasonExpired,
        Self::CounterTrend,
        Self::TrailingTp,
        Self::PartialProfitLock,
        Self::TimeBasedStop,
        Self::PortfolioProtection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LossCircuitBreaker => "loss_circuit_breaker",
            Self::ConfidenceDrop => "confidence_drop",
            Self::SmartHold => "smart_hold",
            Self::EntryReasonExpired => "entry_reason_expired",
            Self::CounterTrend => "counter_trend",
            Self::TrailingTp => "trailing_tp",
            Self::PartialProfitLock => "partial_profit_lock",
            Self::TimeBasedStop => "time_based_stop",
            Self::PortfolioProtection => "portfolio_protection",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a position this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitAction {
    None,
    CloseFull,
    /// Close `fraction` (in `(0, 1]`) of the current quantity.
    ClosePartial { fraction: Decimal },
    AdjustSlTp { stop_loss: Price, take_profit: Price },
}

impl ExitAction {
    /// True for actions that send an order to the exchange.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// True for actions that reduce exposure.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::CloseFull | Self::ClosePartial { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::CloseFull => "close_full",
            Self::ClosePartial { .. } => "close_partial",
            Self::AdjustSlTp { .. } => "adjust_sl_tp",
        }
    }
}

/// Output of evaluating one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub position_id: String,
    pub symbol: String,
    pub action: ExitAction,
    /// `None` only when no rule matched.
    pub reason: Option<ExitReason>,
}

impl ExitDecision {
    /// No rule matched.
    pub fn none(position_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            position_id: position_id.into(),
            symbol: symbol.into(),
            action: ExitAction::None,
            reason: None,
        }
    }

    pub fn new(
        position_id: impl Into<String>,
        symbol: impl Into<String>,
        action: ExitAction,
        reason: ExitReason,
    ) -> Self {
        Self {
            position_id: position_id.into(),
            symbol: symbol.into(),
            action,
            reason: Some(reason),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action.is_actionable()
    }
}

impl fmt::Display for ExitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            Some(reason) => write!(f, "{} {} ({})", self.position_id, self.action.kind(), reason),
            None => write!(f, "{} {}", self.position_id, self.action.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exit_reason_serde_matches_as_str() {
        for reason in ExitReason::ALL {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
    }

    #[test]
    fn test_smart_hold_is_not_actionable() {
        let decision = ExitDecision::new("BTC@1", "BTC", ExitAction::None, ExitReason::SmartHold);
        assert!(!decision.is_actionable());
        assert_eq!(decision.reason, Some(ExitReason::SmartHold));
    }

    #[test]
    fn test_action_kinds() {
        assert!(ExitAction::CloseFull.is_close());
        assert!(ExitAction::ClosePartial { fraction: dec!(0.5) }.is_close());
        let adjust = ExitAction::AdjustSlTp {
            stop_loss: Price::new(dec!(101)),
            take_profit: Price::new(dec!(130)),
        };
        assert!(!adjust.is_close());
        assert!(adjust.is_actionable());
        assert_eq!(adjust.kind(), "adjust_sl_tp");
    }
}
