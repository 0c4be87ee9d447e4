//! Ordered exit rule chain.
//!
//! Rules are evaluated in priority order and the first one that matches
//! decides the position's action for this cycle:
//!
//! | rule | condition                                              | action        |
//! |------|--------------------------------------------------------|---------------|
//! | P0   | loss <= -99% of initial risk                           | close full    |
//! | P1   | confidence / win probability fell >= 20% in 5 min      | close full    |
//! | P2   | deep loss, high rebound probability, high confidence   | explicit hold |
//! | P3   | confidence below the stale-thesis floor                | close full    |
//! | P4   | trend against the position, confidence too low        | close full    |
//! | P5   | ROE above threshold, strong trend, stop can tighten    | adjust SL/TP  |
//! | P6   | ROE above threshold, partial close not yet done        | close part    |
//! | P7   | held past the time stop with negative PnL              | close full    |
//!
//! P0 reads nothing but the position and its recorded initial risk, so no
//! signal can override it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use vigil_core::{Direction, ExitAction, ExitDecision, ExitReason, Position, Price};

use crate::config::MonitorConfig;
use crate::history::ConfidenceSample;
use crate::signal::Trend;

// ============================================================================
// Evaluation input
// ============================================================================

/// Progress of the one-shot partial close for a position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartialProgress {
    #[default]
    NotTaken,
    /// Marker written, outcome unknown: the close is re-driven with its key.
    Pending,
    Done,
}

/// Everything one evaluation needs, sampled once per cycle.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub position: &'a Position,
    pub now: DateTime<Utc>,
    /// Durable entry time (survives restarts).
    pub entry_time: DateTime<Utc>,
    /// Risk recorded at first sighting (survives restarts and stop trails).
    pub initial_risk: Decimal,
    pub partial: PartialProgress,
    pub confidence: Option<f64>,
    pub win_probability: Option<f64>,
    pub rebound_probability: Option<f64>,
    pub trend: Option<Trend>,
    /// Sample taken `confidence_lookback` ago, if any.
    pub baseline: Option<ConfidenceSample>,
}

impl RuleContext<'_> {
    /// Total PnL over the recorded initial risk.
    pub fn loss_ratio(&self) -> Option<Decimal> {
        self.position.loss_ratio(self.initial_risk)
    }
}

// ============================================================================
// ExitRule
// ============================================================================

/// One rule of the chain, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRule {
    LossCircuitBreaker,
    ConfidenceDrop,
    SmartHold,
    EntryReasonExpired,
    CounterTrend,
    TrailingTakeProfit,
    PartialProfitLock,
    TimeStop,
}

impl ExitRule {
    /// Evaluation order.
    pub const CHAIN: [ExitRule; 8] = [
        Self::LossCircuitBreaker,
        Self::ConfidenceDrop,
        Self::SmartHold,
        Self::EntryReasonExpired,
        Self::CounterTrend,
        Self::TrailingTakeProfit,
        Self::PartialProfitLock,
        Self::TimeStop,
    ];

    pub fn reason(&self) -> ExitReason {
        match self {
            Self::LossCircuitBreaker => ExitReason::LossCircuitBreaker,
            Self::ConfidenceDrop => ExitReason::ConfidenceDrop,
            Self::SmartHold => ExitReason::SmartHold,
            Self::EntryReasonExpired => ExitReason::EntryReasonExpired,
            Self::CounterTrend => ExitReason::CounterTrend,
            Self::TrailingTakeProfit => ExitReason::TrailingTp,
            Self::PartialProfitLock => ExitReason::PartialProfitLock,
            Self::TimeStop => ExitReason::TimeBasedStop,
        }
    }

    /// `Some(action)` when the rule matches (`ExitAction::None` = hold).
    pub fn check(&self, ctx: &RuleContext<'_>, config: &MonitorConfig) -> Option<ExitAction> {
        match self {
            Self::LossCircuitBreaker => {
                let loss = ctx.loss_ratio()?;
                (loss <= -config.loss_circuit_breaker_ratio).then_some(ExitAction::CloseFull)
            }
            Self::ConfidenceDrop => {
                let baseline = ctx.baseline?;
                let collapsed = |now: Option<f64>, then: Option<f64>| match (now, then) {
                    (Some(now), Some(then)) if then > 0.0 => {
                        now <= then * (1.0 - config.confidence_drop_ratio)
                    }
                    _ => false,
                };
                (collapsed(ctx.confidence, baseline.confidence)
                    || collapsed(ctx.win_probability, baseline.win_probability))
                .then_some(ExitAction::CloseFull)
            }
            Self::SmartHold => {
                let loss = ctx.loss_ratio()?;
                let rebound = ctx.rebound_probability?;
                let confidence = ctx.confidence?;
                let in_band = loss > -config.loss_circuit_breaker_ratio
                    && loss <= -config.smart_hold_min_loss;
                (in_band
                    && rebound > config.smart_hold_rebound_min
                    && confidence >= config.smart_hold_confidence_min)
                    .then_some(ExitAction::None)
            }
            Self::EntryReasonExpired => {
                let confidence = ctx.confidence?;
                (confidence < config.stale_thesis_confidence).then_some(ExitAction::CloseFull)
            }
            Self::CounterTrend => {
                let trend = ctx.trend?;
                let confidence = ctx.confidence?;
                (trend.direction == ctx.position.direction.opposite()
                    && confidence < config.counter_trend_confidence)
                    .then_some(ExitAction::CloseFull)
            }
            Self::TrailingTakeProfit => {
                let roe = ctx.position.roe()?;
                let trend = ctx.trend?;
                if roe <= config.trailing_tp_threshold
                    || trend.direction != ctx.position.direction
                    || trend.strength < config.trailing_trend_strength
                {
                    return None;
                }
                let stop = trailed_stop(ctx.position, config.trailing_lock_ratio);
                tightens(ctx.position, stop).then_some(ExitAction::AdjustSlTp {
                    stop_loss: stop,
                    take_profit: ctx.position.take_profit,
                })
            }
            Self::PartialProfitLock => match ctx.partial {
                PartialProgress::Done => None,
                PartialProgress::Pending => Some(ExitAction::ClosePartial {
                    fraction: config.partial_profit_fraction,
                }),
                PartialProgress::NotTaken => {
                    let roe = ctx.position.roe()?;
                    (roe > config.partial_profit_threshold).then_some(ExitAction::ClosePartial {
                        fraction: config.partial_profit_fraction,
                    })
                }
            },
            Self::TimeStop => {
                let held = ctx.now - ctx.entry_time;
                (held > config.time_stop() && ctx.position.unrealized_pnl() < Decimal::ZERO)
                    .then_some(ExitAction::CloseFull)
            }
        }
    }
}

/// Stop that locks `lock_ratio` of the open gain.
fn trailed_stop(position: &Position, lock_ratio: Decimal) -> Price {
    let entry = position.entry_price.inner();
    let gain = position.mark_price.inner() - entry;
    Price::new(entry + gain * lock_ratio)
}

/// Whether `stop` is closer to the mark than the current stop.
fn tightens(position: &Position, stop: Price) -> bool {
    if position.stop_loss.is_zero() {
        return true;
    }
    match position.direction {
        Direction::Long => stop > position.stop_loss,
        Direction::Short => stop < position.stop_loss,
    }
}

// ============================================================================
// ExitRuleChain
// ============================================================================

/// Evaluates [`ExitRule::CHAIN`] against a position.
#[derive(Debug, Clone)]
pub struct ExitRuleChain {
    config: MonitorConfig,
}

impl ExitRuleChain {
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// First matching rule decides; no match yields `ExitDecision::none`.
    #[must_use]
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> ExitDecision {
        let position_id = ctx.position.position_id();
        let symbol = ctx.position.symbol.clone();
        for rule in ExitRule::CHAIN {
            if let Some(action) = rule.check(ctx, &self.config) {
                return ExitDecision::new(position_id, symbol, action, rule.reason());
            }
        }
        ExitDecision::none(position_id, symbol)
    }
}
