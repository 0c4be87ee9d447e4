//! Aggregate margin protection.
//!
//! Runs after the per-position rule chain with its own cooldown. When
//! margin in use over account equity exceeds `max_margin_ratio`, the
//! worst-performing position that the chain left untouched is closed.
//! The cooldown starts once that close has executed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};
use vigil_core::{Balance, ExitAction, ExitDecision, ExitReason, Position};

use crate::config::PortfolioConfig;

/// A position the rule chain left untouched, with its recorded initial risk.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub position: &'a Position,
    pub initial_risk: Decimal,
}

impl Candidate<'_> {
    fn loss_ratio(&self) -> Option<Decimal> {
        self.position.loss_ratio(self.initial_risk)
    }
}

#[derive(Debug)]
pub struct PortfolioGuard {
    config: PortfolioConfig,
    last_triggered: Mutex<Option<DateTime<Utc>>>,
}

impl PortfolioGuard {
    #[must_use]
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            last_triggered: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.last_triggered
            .lock()
            .is_some_and(|at| now - at < self.config.cooldown())
    }

    /// Start the cooldown; call once the forced close has executed.
    pub fn record_triggered(&self, at: DateTime<Utc>) {
        *self.last_triggered.lock() = Some(at);
    }

    /// Pick the position to force-close, if any.
    ///
    /// Does not start the cooldown, see [`Self::record_triggered`].
    ///
    /// # Arguments
    /// * `balance` - Current account balance
    /// * `candidates` - Positions with no other action this cycle
    /// * `now` - Wall-clock time (cooldown reference)
    pub fn evaluate(
        &self,
        balance: &Balance,
        candidates: &[Candidate<'_>],
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        if !self.config.enabled {
            return None;
        }
        let ratio = balance.margin_ratio()?;
        if ratio <= self.config.max_margin_ratio {
            return None;
        }
        if self.cooling_down(now) {
            debug!(margin_ratio = %ratio, "Portfolio margin over limit, guard cooling down");
            return None;
        }

        let worst = candidates
            .iter()
            .min_by_key(|c| c.loss_ratio().unwrap_or(Decimal::ZERO))?;

        warn!(
            margin_ratio = %ratio,
            max_margin_ratio = %self.config.max_margin_ratio,
            symbol = %worst.position.symbol,
            loss_ratio = ?worst.loss_ratio(),
            "Portfolio margin over limit, closing worst position"
        );
        Some(ExitDecision::new(
            worst.position.position_id(),
            worst.position.symbol.clone(),
            ExitAction::CloseFull,
            ExitReason::PortfolioProtection,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use vigil_core::{Direction, PositionStatus, Price, Size};

    fn position(symbol: &str, mark: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            entry_price: Price::new(dec!(100)),
            quantity: Size::new(dec!(1)),
            leverage: dec!(10),
            stop_loss: Price::ZERO,
            take_profit: Price::ZERO,
            margin_used: dec!(10),
            entry_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            status: PositionStatus::Open,
            mark_price: Price::new(mark),
            realized_pnl: Decimal::ZERO,
        }
    }

    fn candidate(position: &Position) -> Candidate<'_> {
        Candidate {
            position,
            initial_risk: position.risk_at_stop(),
        }
    }

    fn stressed() -> Balance {
        Balance {
            equity: dec!(100),
            available: dec!(10),
            margin_used: dec!(90),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_closes_worst_position() {
        let guard = PortfolioGuard::new(PortfolioConfig::default());
        let a = position("BTCUSDT", dec!(99));
        let b = position("ETHUSDT", dec!(96));
        let c = position("SOLUSDT", dec!(102));

        let candidates = [candidate(&a), candidate(&b), candidate(&c)];

        let decision = guard.evaluate(&stressed(), &candidates, now()).unwrap();
        assert_eq!(decision.symbol, "ETHUSDT");
        assert_eq!(decision.reason, Some(ExitReason::PortfolioProtection));
    }

    #[test]
    fn test_ranks_by_recorded_initial_risk() {
        let guard = PortfolioGuard::new(PortfolioConfig::default());
        // Same -3 loss, but BTC was entered with half the risk.
        let a = position("BTCUSDT", dec!(97));
        let b = position("ETHUSDT", dec!(97));
        let candidates = [
            Candidate {
                position: &a,
                initial_risk: dec!(5),
            },
            candidate(&b),
        ];

        let decision = guard.evaluate(&stressed(), &candidates, now()).unwrap();
        assert_eq!(decision.symbol, "BTCUSDT");
    }

    #[test]
    fn test_below_limit_does_nothing() {
        let guard = PortfolioGuard::new(PortfolioConfig::default());
        let a = position("BTCUSDT", dec!(99));
        let calm = Balance {
            equity: dec!(100),
            available: dec!(50),
            margin_used: dec!(50),
        };
        assert!(guard.evaluate(&calm, &[candidate(&a)], now()).is_none());
    }

    #[test]
    fn test_cooldown_between_triggers() {
        let guard = PortfolioGuard::new(PortfolioConfig::default());
        let a = position("BTCUSDT", dec!(99));
        let candidates = [candidate(&a)];

        assert!(guard.evaluate(&stressed(), &candidates, now()).is_some());
        guard.record_triggered(now());
        assert!(guard
            .evaluate(&stressed(), &candidates, now() + Duration::seconds(299))
            .is_none());
        assert!(guard
            .evaluate(&stressed(), &candidates, now() + Duration::seconds(300))
            .is_some());
    }

    #[test]
    fn test_decision_alone_does_not_start_cooldown() {
        let guard = PortfolioGuard::new(PortfolioConfig::default());
        let a = position("BTCUSDT", dec!(99));
        let candidates = [candidate(&a)];

        assert!(guard.evaluate(&stressed(), &candidates, now()).is_some());
        assert!(guard
            .evaluate(&stressed(), &candidates, now() + Duration::seconds(1))
            .is_some());
    }

    #[test]
    fn test_no_candidates_does_not_start_cooldown() {
        let guard = PortfolioGuard::new(PortfolioConfig::default());
        assert!(guard.evaluate(&stressed(), &[], now()).is_none());

        let a = position("BTCUSDT", dec!(99));
        assert!(guard.evaluate(&stressed(), &[candidate(&a)], now()).is_some());
    }

    #[test]
    fn test_disabled() {
        let guard = PortfolioGuard::new(PortfolioConfig {
            enabled: false,
            ..PortfolioConfig::default()
        });
        let a = position("BTCUSDT", dec!(99));
        assert!(guard.evaluate(&stressed(), &[candidate(&a)], now()).is_none());
    }
}
