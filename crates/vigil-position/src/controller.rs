//! Position risk controller.
//!
//! Every `monitor_interval` the controller:
//! 1. Fetches open positions (a `query` through the coordinator); on failure the cycle is skipped
//! 2. Reconciles durable entry times (store value wins) and drops state of closed symbols
//! 3. Samples signals into the confidence history
//! 4. Runs the exit rule chain per position, then the portfolio guard
//! 5. Executes every actionable decision concurrently through the coordinator
//!
//! In observation (dry-run) mode step 5 only logs.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{
    ExitAction, ExitDecision, ExitReason, IdempotencyKey, OperationClass, OperationRequest,
    OrderSpec, Position, Price, Priority,
};
use vigil_executor::{ExecutionCoordinator, ExecutionOutcome, Payload};
use vigil_persistence::{
    EntryTimeStore, ExitRecord, InitialRiskStore, PartialCloseMarker, PartialCloseStore,
    TradeStore,
};
use vigil_telemetry::Metrics;

use crate::clock::Clock;
use crate::config::{MonitorConfig, PortfolioConfig};
use crate::error::PositionResult;
use crate::history::{ConfidenceHistory, ConfidenceSample};
use crate::portfolio::{Candidate, PortfolioGuard};
use crate::rules::{ExitRuleChain, PartialProgress, RuleContext};
use crate::signal::SignalSource;

/// Purpose tag of the partial close idempotency key.
const PARTIAL_CLOSE_PURPOSE: &str = "partial_profit_lock";

// ============================================================================
// RiskStores / CycleReport
// ============================================================================

/// Durable state the controller writes (it is the only writer).
#[derive(Clone)]
pub struct RiskStores {
    pub entry_times: Arc<dyn EntryTimeStore>,
    pub initial_risks: Arc<dyn InitialRiskStore>,
    pub partials: Arc<dyn PartialCloseStore>,
    pub trades: Arc<dyn TradeStore>,
}

/// Summary of one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Positions could not be fetched; nothing was evaluated.
    pub skipped: bool,
    pub evaluated: usize,
    /// Every decision a rule (or the portfolio guard) produced, holds included.
    pub decisions: Vec<ExitDecision>,
    pub executed: usize,
    pub failures: usize,
    /// Positions found gone on the exchange and dropped from durable state.
    pub dropped: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Decision for `symbol`, if one was made.
    #[must_use]
    pub fn decision_for(&self, symbol: &str) -> Option<&ExitDecision> {
        self.decisions.iter().find(|d| d.symbol == symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionResult {
    Executed,
    Failed,
    Dropped,
}

// ============================================================================
// PositionRiskController
// ============================================================================

pub struct PositionRiskController {
    coordinator: Arc<ExecutionCoordinator>,
    signals: Arc<dyn SignalSource>,
    stores: RiskStores,
    clock: Arc<dyn Clock>,
    rules: ExitRuleChain,
    portfolio: PortfolioGuard,
    history: Mutex<ConfidenceHistory>,
    dry_run: bool,
}

impl PositionRiskController {
    /// Create a controller.
    ///
    /// # Arguments
    /// * `coordinator` - Sole path to the exchange
    /// * `signals` - Confidence / trend oracle
    /// * `stores` - Durable entry times, initial risks, partial-close markers and exit log
    /// * `clock` - Wall-clock source
    /// * `monitor` - Rule thresholds and cadence (validated here)
    /// * `portfolio` - Aggregate margin guard (validated here)
    pub fn new(
        coordinator: Arc<ExecutionCoordinator>,
        signals: Arc<dyn SignalSource>,
        stores: RiskStores,
        clock: Arc<dyn Clock>,
        monitor: MonitorConfig,
        portfolio: PortfolioConfig,
    ) -> PositionResult<Self> {
        monitor.validate()?;
        portfolio.validate()?;
        Ok(Self {
            coordinator,
            signals,
            stores,
            clock,
            rules: ExitRuleChain::new(monitor),
            portfolio: PortfolioGuard::new(portfolio),
            history: Mutex::new(ConfidenceHistory::new()),
            dry_run: false,
        })
    }

    /// Log decisions instead of executing them.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Load durable entry times at startup.
    ///
    /// Returns the number of restored entries.
    pub fn restore(&self) -> PositionResult<usize> {
        if !self.stores.entry_times.is_durable() {
            warn!(
                "non-compliant: entry-time store is not durable, \
                 the time stop clock restarts with the process"
            );
        }
        let entries = self.stores.entry_times.entries()?;
        for (symbol, entry_time) in &entries {
            info!(symbol = %symbol, entry_time = %entry_time, "Restored entry time");
        }
        info!(count = entries.len(), "Position state restored");
        Ok(entries.len())
    }

    /// Run cycles every `monitor_interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = self.rules.config().monitor_interval();
        info!(
            interval_secs = interval.as_secs(),
            dry_run = self.dry_run,
            "Position monitor started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Position monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(
                        skipped = report.skipped,
                        evaluated = report.evaluated,
                        decisions = report.decisions.len(),
                        executed = report.executed,
                        failures = report.failures,
                        "Monitor cycle complete"
                    );
                }
            }
        }
    }

    /// One full monitor cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let now = self.clock.now();

        let mut positions = match self.coordinator.get_positions(Priority::Critical).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "Failed to fetch positions, skipping cycle");
                Metrics::monitor_cycle("skipped");
                return CycleReport::skipped();
            }
        };
        positions.retain(Position::is_open);
        Metrics::open_positions(positions.len());

        let risks = self.reconcile(&mut positions);
        let mut decisions = self.evaluate_all(&positions, &risks, now);

        if self.portfolio.is_enabled() && !positions.is_empty() {
            self.apply_portfolio_guard(&positions, &risks, &mut decisions, now)
                .await;
        }

        let mut report = CycleReport {
            evaluated: positions.len(),
            ..CycleReport::default()
        };

        let mut actions = Vec::new();
        for (position, decision) in positions.iter().zip(decisions) {
            let Some(reason) = decision.reason else {
                continue;
            };
            Metrics::exit_decision(reason.as_str(), decision.action.kind());
            if decision.is_actionable() {
                info!(
                    symbol = %decision.symbol,
                    position_id = %decision.position_id,
                    action = decision.action.kind(),
                    reason = %reason,
                    "Exit decision"
                );
                actions.push((position, decision.clone()));
            } else {
                debug!(symbol = %decision.symbol, reason = %reason, "Holding position");
            }
            report.decisions.push(decision);
        }

        if self.dry_run {
            for (_, decision) in &actions {
                info!(
                    symbol = %decision.symbol,
                    action = decision.action.kind(),
                    "Observation mode: decision not executed"
                );
            }
            Metrics::monitor_cycle("ok");
            return report;
        }

        let results = join_all(
            actions
                .iter()
                .map(|(position, decision)| self.act(position, decision, now)),
        )
        .await;
        for ((_, decision), result) in actions.iter().zip(results) {
            if result == ActionResult::Executed
                && decision.reason == Some(ExitReason::PortfolioProtection)
            {
                self.portfolio.record_triggered(now);
            }
            match result {
                ActionResult::Executed => report.executed += 1,
                ActionResult::Failed => report.failures += 1,
                ActionResult::Dropped => report.dropped += 1,
            }
        }

        Metrics::monitor_cycle(if report.failures == 0 { "ok" } else { "partial" });
        report
    }

    // ------------------------------------------------------------------------
    // Durable state
    // ------------------------------------------------------------------------

    /// Replace each snapshot's entry time with the durable one and drop
    /// state of symbols that are no longer open.
    ///
    /// Returns the initial risk of each position, in order.
    fn reconcile(&self, positions: &mut [Position]) -> Vec<Decimal> {
        for position in positions.iter_mut() {
            match self.stores.entry_times.get(&position.symbol) {
                Ok(Some(stored)) => {
                    if stored != position.entry_time {
                        debug!(
                            symbol = %position.symbol,
                            stored = %stored,
                            reported = %position.entry_time,
                            "Using durable entry time"
                        );
                    }
                    position.entry_time = stored;
                }
                Ok(None) => match self
                    .stores
                    .entry_times
                    .put(&position.symbol, position.entry_time)
                {
                    Ok(()) => info!(
                        symbol = %position.symbol,
                        entry_time = %position.entry_time,
                        "Recorded entry time"
                    ),
                    Err(e) => error!(symbol = %position.symbol, error = %e, "Failed to persist entry time"),
                },
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "Failed to read entry time");
                }
            }
        }

        match self.stores.entry_times.entries() {
            Ok(entries) => {
                for (symbol, _) in entries {
                    if !positions.iter().any(|p| p.symbol == symbol) {
                        info!(symbol = %symbol, "Position no longer open, dropping durable state");
                        self.forget(&symbol);
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to list entry times"),
        }

        let open: Vec<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
        self.history.lock().retain_symbols(&open);

        positions.iter().map(|p| self.initial_risk(p)).collect()
    }

    /// Durable initial risk, recorded from this snapshot at first sighting.
    fn initial_risk(&self, position: &Position) -> Decimal {
        match self.stores.initial_risks.get_risk(&position.symbol) {
            Ok(Some(risk)) => risk,
            Ok(None) => {
                let risk = position.risk_at_stop();
                match self.stores.initial_risks.put_risk(&position.symbol, risk) {
                    Ok(()) => info!(symbol = %position.symbol, initial_risk = %risk, "Recorded initial risk"),
                    Err(e) => error!(symbol = %position.symbol, error = %e, "Failed to persist initial risk"),
                }
                risk
            }
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "Failed to read initial risk, using current stop");
                position.risk_at_stop()
            }
        }
    }

    /// Drop the entry time, initial risk and partial marker of `symbol`.
    fn forget(&self, symbol: &str) {
        if let Err(e) = self.stores.entry_times.delete(symbol) {
            error!(symbol = %symbol, error = %e, "Failed to delete entry time");
        }
        if let Err(e) = self.stores.initial_risks.delete_risk(symbol) {
            error!(symbol = %symbol, error = %e, "Failed to delete initial risk");
        }
        if let Err(e) = self.stores.partials.delete_marker(symbol) {
            error!(symbol = %symbol, error = %e, "Failed to delete partial close marker");
        }
        self.history.lock().remove(symbol);
    }

    fn partial_progress(&self, position: &Position) -> PartialProgress {
        let marker = match self.stores.partials.get_marker(&position.symbol) {
            Ok(marker) => marker,
            Err(e) => {
                // Unknown progress: never risk a second partial close.
                error!(symbol = %position.symbol, error = %e, "Failed to read partial close marker");
                return PartialProgress::Done;
            }
        };
        match marker {
            None => PartialProgress::NotTaken,
            Some(m) if m.position_id != position.position_id() => {
                debug!(symbol = %position.symbol, stale = %m.position_id, "Discarding marker of an earlier position");
                if let Err(e) = self.stores.partials.delete_marker(&position.symbol) {
                    error!(symbol = %position.symbol, error = %e, "Failed to delete partial close marker");
                }
                PartialProgress::NotTaken
            }
            Some(m) if m.is_done() => PartialProgress::Done,
            Some(_) => PartialProgress::Pending,
        }
    }

    // ------------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------------

    fn evaluate_all(
        &self,
        positions: &[Position],
        risks: &[Decimal],
        now: DateTime<Utc>,
    ) -> Vec<ExitDecision> {
        let cutoff = now - self.rules.config().confidence_lookback();
        positions
            .iter()
            .zip(risks)
            .map(|(position, &initial_risk)| {
                let symbol = position.symbol.as_str();
                let confidence = self.signals.current_confidence(symbol);
                let win_probability = self.signals.current_win_probability(symbol);

                let baseline = {
                    let mut history = self.history.lock();
                    let baseline = history.baseline(symbol, cutoff);
                    if confidence.is_some() || win_probability.is_some() {
                        history.record(
                            symbol,
                            ConfidenceSample {
                                at: now,
                                confidence,
                                win_probability,
                            },
                        );
                    }
                    history.prune(symbol, cutoff);
                    baseline
                };

                let ctx = RuleContext {
                    position,
                    now,
                    entry_time: position.entry_time,
                    initial_risk,
                    partial: self.partial_progress(position),
                    confidence,
                    win_probability,
                    rebound_probability: self.signals.rebound_probability(symbol),
                    trend: self.signals.trend(symbol),
                    baseline,
                };
                self.rules.evaluate(&ctx)
            })
            .collect()
    }

    async fn apply_portfolio_guard(
        &self,
        positions: &[Position],
        risks: &[Decimal],
        decisions: &mut [ExitDecision],
        now: DateTime<Utc>,
    ) {
        let balance = match self.coordinator.get_account_balance(Priority::Critical).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(error = %e, "Failed to fetch balance, skipping portfolio check");
                return;
            }
        };
        if let Some(ratio) = balance.margin_ratio().and_then(|r| r.to_f64()) {
            Metrics::portfolio_margin_ratio(ratio);
        }

        // A smart hold is a decision too: the guard only takes positions
        // no rule spoke for.
        let candidates: Vec<Candidate<'_>> = positions
            .iter()
            .zip(risks)
            .zip(decisions.iter())
            .filter(|(_, d)| !d.is_actionable() && d.reason != Some(ExitReason::SmartHold))
            .map(|((position, &initial_risk), _)| Candidate {
                position,
                initial_risk,
            })
            .collect();

        if let Some(forced) = self.portfolio.evaluate(&balance, &candidates, now) {
            if let Some(slot) = decisions.iter_mut().find(|d| d.symbol == forced.symbol) {
                *slot = forced;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    async fn act(
        &self,
        position: &Position,
        decision: &ExitDecision,
        now: DateTime<Utc>,
    ) -> ActionResult {
        let Some(reason) = decision.reason else {
            return ActionResult::Executed;
        };
        match &decision.action {
            ExitAction::None => ActionResult::Executed,
            ExitAction::CloseFull => self.close_full(position, reason, now).await,
            ExitAction::ClosePartial { fraction } => self.close_partial(position, *fraction).await,
            ExitAction::AdjustSlTp {
                stop_loss,
                take_profit,
            } => self.adjust_protection(position, *stop_loss, *take_profit).await,
        }
    }

    async fn close_full(
        &self,
        position: &Position,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> ActionResult {
        let key = IdempotencyKey::new();
        let spec = OrderSpec::reduce_only_market(
            position.symbol.clone(),
            position.direction.closing_side(),
            position.quantity,
            key.clone(),
        );
        let request =
            OperationRequest::with_key(OperationClass::ClosePosition, Priority::Critical, key);

        let outcome = self
            .coordinator
            .execute(request, Payload::PlaceOrder(spec))
            .await;
        let ExecutionOutcome::Success(receipt) = outcome else {
            return self.handle_failure(position, "close_full", outcome);
        };

        let record = match receipt.fill() {
            Some(fill) => ExitRecord {
                position_id: position.position_id(),
                symbol: position.symbol.clone(),
                reason,
                realized_pnl: position.realized_pnl + fill.realized_pnl,
                quantity: fill.filled_quantity,
                exit_price: fill.average_price,
                closed_at: fill.filled_at,
            },
            None => ExitRecord {
                position_id: position.position_id(),
                symbol: position.symbol.clone(),
                reason,
                realized_pnl: position.total_pnl(),
                quantity: position.quantity,
                exit_price: position.mark_price,
                closed_at: now,
            },
        };

        info!(
            symbol = %record.symbol,
            reason = %reason,
            realized_pnl = %record.realized_pnl,
            exit_price = %record.exit_price,
            "Position closed"
        );
        if let Some(pnl) = record.realized_pnl.to_f64() {
            Metrics::realized_pnl(reason.as_str(), pnl);
        }
        match self.stores.trades.record_exit(&record) {
            Ok(true) => {}
            Ok(false) => debug!(position_id = %record.position_id, "Exit already recorded"),
            Err(e) => error!(position_id = %record.position_id, error = %e, "Failed to record exit"),
        }
        self.forget(&position.symbol);
        ActionResult::Executed
    }

    async fn close_partial(&self, position: &Position, fraction: Decimal) -> ActionResult {
        let position_id = position.position_id();

        // Write-ahead: the marker (with the key the order carries) is durable
        // before the order can possibly execute.
        let marker = match self.stores.partials.get_marker(&position.symbol) {
            Ok(Some(m)) if m.position_id == position_id && !m.is_done() => m,
            Ok(_) => {
                let marker = PartialCloseMarker::pending(
                    position_id.clone(),
                    IdempotencyKey::derived(&position_id, PARTIAL_CLOSE_PURPOSE),
                    fraction,
                );
                if let Err(e) = self.stores.partials.put_marker(&position.symbol, marker.clone()) {
                    error!(symbol = %position.symbol, error = %e, "Failed to persist partial close marker, not sending");
                    return ActionResult::Failed;
                }
                marker
            }
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "Failed to read partial close marker, not sending");
                return ActionResult::Failed;
            }
        };

        let quantity = position.quantity.fraction(marker.fraction);
        if !quantity.is_positive() {
            warn!(symbol = %position.symbol, "Partial close quantity rounds to zero");
            return ActionResult::Failed;
        }

        let spec = OrderSpec::reduce_only_market(
            position.symbol.clone(),
            position.direction.closing_side(),
            quantity,
            marker.idempotency_key.clone(),
        );
        let request = OperationRequest::with_key(
            OperationClass::ClosePosition,
            Priority::Critical,
            marker.idempotency_key.clone(),
        );

        let outcome = self
            .coordinator
            .execute(request, Payload::PlaceOrder(spec))
            .await;
        let ExecutionOutcome::Success(receipt) = outcome else {
            return self.handle_failure(position, "close_partial", outcome);
        };

        if let Err(e) = self
            .stores
            .partials
            .put_marker(&position.symbol, marker.completed())
        {
            // Still Pending: the next cycle re-sends the same key, which
            // the exchange answers with this fill.
            error!(symbol = %position.symbol, error = %e, "Failed to mark partial close done");
        }
        if let Some(fill) = receipt.fill() {
            info!(
                symbol = %position.symbol,
                quantity = %fill.filled_quantity,
                price = %fill.average_price,
                realized_pnl = %fill.realized_pnl,
                "Partial profit locked"
            );
            if let Some(pnl) = fill.realized_pnl.to_f64() {
                Metrics::realized_pnl(ExitReason::PartialProfitLock.as_str(), pnl);
            }
        }
        ActionResult::Executed
    }

    async fn adjust_protection(
        &self,
        position: &Position,
        stop_loss: Price,
        take_profit: Price,
    ) -> ActionResult {
        let request = OperationRequest::new(OperationClass::AdjustProtection, Priority::High);
        let outcome = self
            .coordinator
            .execute(
                request,
                Payload::AdjustProtection {
                    symbol: position.symbol.clone(),
                    stop_loss,
                    take_profit,
                },
            )
            .await;

        match outcome {
            ExecutionOutcome::Success(_) => {
                info!(
                    symbol = %position.symbol,
                    old_stop = %position.stop_loss,
                    new_stop = %stop_loss,
                    "Stop trailed"
                );
                ActionResult::Executed
            }
            other => self.handle_failure(position, "adjust_protection", other),
        }
    }

    fn handle_failure(
        &self,
        position: &Position,
        action: &'static str,
        outcome: ExecutionOutcome,
    ) -> ActionResult {
        match outcome {
            ExecutionOutcome::Success(_) => ActionResult::Executed,
            ExecutionOutcome::Blocked { level } => {
                warn!(symbol = %position.symbol, action, level = %level, "Exit blocked by circuit breaker");
                ActionResult::Failed
            }
            ExecutionOutcome::RetryableFailure { error, attempts } => {
                warn!(
                    symbol = %position.symbol,
                    action,
                    attempts,
                    error = %error,
                    "Exit failed, re-evaluating next cycle"
                );
                ActionResult::Failed
            }
            ExecutionOutcome::FatalFailure { error } if error.is_position_not_found() => {
                info!(symbol = %position.symbol, action, "Position already gone, dropping durable state");
                self.forget(&position.symbol);
                ActionResult::Dropped
            }
            ExecutionOutcome::FatalFailure { error } => {
                error!(symbol = %position.symbol, action, error = %error, "Exit failed (fatal)");
                ActionResult::Failed
            }
        }
    }
}

impl std::fmt::Debug for PositionRiskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionRiskController")
            .field("rules", &self.rules)
            .field("portfolio", &self.portfolio)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::signal::{SignalSnapshot, StaticSignalSource, Trend};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use vigil_admission::{BreakerConfig, GradedCircuitBreaker, TokenBucketLimiter};
    use vigil_core::{Direction, PositionStatus, Size};
    use vigil_executor::{
        DynGateway, ExecutorConfig, FatalKind, GatewayError, PaperExchange, PaperOp,
        RetryableKind,
    };
    use vigil_persistence::{MarkerState, MemoryStateStore, MemoryTradeStore};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Long 10 @ 100, stop 90, margin 100.
    fn position(symbol: &str, mark: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            entry_price: Price::new(dec!(100)),
            quantity: Size::new(dec!(10)),
            leverage: dec!(10),
            stop_loss: Price::new(dec!(90)),
            take_profit: Price::ZERO,
            margin_used: dec!(100),
            entry_time: start(),
            status: PositionStatus::Open,
            mark_price: Price::new(mark),
            realized_pnl: Decimal::ZERO,
        }
    }

    struct Harness {
        exchange: Arc<PaperExchange>,
        signals: Arc<StaticSignalSource>,
        state: Arc<MemoryStateStore>,
        trades: Arc<MemoryTradeStore>,
        clock: Arc<ManualClock>,
        controller: PositionRiskController,
    }

    fn harness(equity: Decimal, positions: Vec<Position>) -> Harness {
        harness_with(equity, positions, PortfolioConfig::default())
    }

    fn harness_with(
        equity: Decimal,
        positions: Vec<Position>,
        portfolio: PortfolioConfig,
    ) -> Harness {
        let exchange = Arc::new(PaperExchange::new(equity));
        for p in positions {
            exchange.open_position(p);
        }
        let breaker = Arc::new(GradedCircuitBreaker::new(BreakerConfig::default()).unwrap());
        let limiter = Arc::new(TokenBucketLimiter::new(100, 100.0).unwrap());
        let coordinator = Arc::new(
            ExecutionCoordinator::new(
                Arc::clone(&exchange) as DynGateway,
                breaker,
                limiter,
                &ExecutorConfig::default(),
            )
            .unwrap(),
        );
        let signals = Arc::new(StaticSignalSource::new());
        let state = Arc::new(MemoryStateStore::new());
        let trades = Arc::new(MemoryTradeStore::new());
        let clock = Arc::new(ManualClock::new(start() + Duration::hours(1)));
        let controller = PositionRiskController::new(
            coordinator,
            Arc::clone(&signals) as Arc<dyn SignalSource>,
            RiskStores {
                entry_times: Arc::clone(&state) as Arc<dyn EntryTimeStore>,
                initial_risks: Arc::clone(&state) as Arc<dyn InitialRiskStore>,
                partials: Arc::clone(&state) as Arc<dyn PartialCloseStore>,
                trades: Arc::clone(&trades) as Arc<dyn TradeStore>,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
            MonitorConfig::default(),
            portfolio,
        )
        .unwrap();
        Harness {
            exchange,
            signals,
            state,
            trades,
            clock,
            controller,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_breaker_closes_and_records_exit() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(90))]);
        h.signals.set(
            "BTCUSDT",
            SignalSnapshot {
                confidence: Some(0.95),
                win_probability: Some(0.9),
                rebound_probability: Some(0.95),
                trend: Some(Trend::new(Direction::Long, 0.9)),
            },
        );

        let report = h.controller.run_cycle().await;

        assert_eq!(report.executed, 1);
        assert_eq!(
            report.decision_for("BTCUSDT").unwrap().reason,
            Some(ExitReason::LossCircuitBreaker)
        );
        assert!(h.exchange.position("BTCUSDT").is_none());
        let exits = h.trades.exits().unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].realized_pnl, dec!(-100));
        assert_eq!(h.state.get("BTCUSDT").unwrap(), None);
        assert_eq!(h.state.get_risk("BTCUSDT").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailed_stop_keeps_first_seen_risk() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(100))]);
        h.controller.run_cycle().await;
        assert_eq!(h.state.get_risk("BTCUSDT").unwrap(), Some(dec!(100)));

        // Stop trailed above entry; the loss is 15% of the risk taken at entry.
        let mut trailed = position("BTCUSDT", dec!(98.5));
        trailed.stop_loss = Price::new(dec!(101.5));
        h.exchange.open_position(trailed);
        h.clock.advance(Duration::minutes(1));

        let report = h.controller.run_cycle().await;
        assert!(report.decision_for("BTCUSDT").is_none());
        assert_eq!(report.executed, 0);
        assert!(h.exchange.position("BTCUSDT").is_some());
        assert_eq!(h.state.get_risk("BTCUSDT").unwrap(), Some(dec!(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_close_happens_once() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(107))]);

        let first = h.controller.run_cycle().await;
        assert_eq!(first.executed, 1);
        let marker = h.state.get_marker("BTCUSDT").unwrap().unwrap();
        assert_eq!(marker.state, MarkerState::Done);
        assert_eq!(
            h.exchange.position("BTCUSDT").unwrap().quantity,
            Size::new(dec!(5))
        );

        for _ in 0..3 {
            h.clock.advance(Duration::minutes(1));
            let report = h.controller.run_cycle().await;
            assert_eq!(report.executed, 0);
        }
        assert_eq!(h.exchange.executed_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_stop_uses_durable_entry_time() {
        let mut reported = position("ETHUSDT", dec!(99));
        // Exchange reports a later entry time than the one persisted.
        reported.entry_time = start() + Duration::hours(20);
        let h = harness(dec!(10_000), vec![reported]);
        h.state.put("ETHUSDT", start()).unwrap();

        h.clock.set(start() + Duration::hours(24) + Duration::minutes(1));
        let report = h.controller.run_cycle().await;

        assert_eq!(
            report.decision_for("ETHUSDT").unwrap().reason,
            Some(ExitReason::TimeBasedStop)
        );
        assert_eq!(report.executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_persists_entry_time() {
        let h = harness(dec!(10_000), vec![position("SOLUSDT", dec!(100))]);
        let report = h.controller.run_cycle().await;

        assert!(report.decisions.is_empty());
        assert_eq!(h.state.get("SOLUSDT").unwrap(), Some(start()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_skips_cycle() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(90))]);
        for _ in 0..3 {
            h.exchange.inject_failure(
                PaperOp::GetPositions,
                GatewayError::retryable(RetryableKind::Network, "reset"),
            );
        }

        let report = h.controller.run_cycle().await;
        assert!(report.skipped);
        assert!(h.exchange.position("BTCUSDT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_does_not_execute() {
        let mut h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(90))]);
        h.controller = h.controller.with_dry_run(true);

        let report = h.controller.run_cycle().await;
        assert_eq!(report.decisions.len(), 1);
        assert_eq!(report.executed, 0);
        assert!(h.exchange.executed_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_not_found_drops_state() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(90))]);
        h.state.put("BTCUSDT", start()).unwrap();
        h.exchange.inject_failure(
            PaperOp::PlaceOrder,
            GatewayError::fatal(FatalKind::PositionNotFound, "closed"),
        );

        let report = h.controller.run_cycle().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(h.state.get("BTCUSDT").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_symbols_are_forgotten() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(100))]);
        h.state.put("XRPUSDT", start()).unwrap();
        h.state
            .put_marker(
                "XRPUSDT",
                PartialCloseMarker::pending("XRPUSDT@0", IdempotencyKey::new(), dec!(0.5)),
            )
            .unwrap();

        h.state.put_risk("XRPUSDT", dec!(40)).unwrap();

        h.controller.run_cycle().await;
        assert_eq!(h.state.get("XRPUSDT").unwrap(), None);
        assert_eq!(h.state.get_risk("XRPUSDT").unwrap(), None);
        assert_eq!(h.state.get_marker("XRPUSDT").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confidence_collapse_across_cycles() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(101))]);
        h.signals.set_confidence("BTCUSDT", 0.9);
        let report = h.controller.run_cycle().await;
        assert!(report.decisions.is_empty());

        h.clock.advance(Duration::minutes(5));
        h.signals.set_confidence("BTCUSDT", 0.6);
        let report = h.controller.run_cycle().await;
        assert_eq!(
            report.decision_for("BTCUSDT").unwrap().reason,
            Some(ExitReason::ConfidenceDrop)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_stop_is_amended() {
        let h = harness(dec!(10_000), vec![position("BTCUSDT", dec!(103))]);
        h.signals.set_trend("BTCUSDT", Trend::new(Direction::Long, 0.8));

        let report = h.controller.run_cycle().await;
        assert_eq!(report.executed, 1);
        assert_eq!(
            h.exchange.position("BTCUSDT").unwrap().stop_loss,
            Price::new(dec!(101.5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_portfolio_guard_closes_worst_untouched_position() {
        // 3 x 100 margin on 330 equity: ratio above 0.80
        let h = harness(
            dec!(330),
            vec![
                position("BTCUSDT", dec!(100)),
                position("ETHUSDT", dec!(97)),
                position("SOLUSDT", dec!(101)),
            ],
        );

        let report = h.controller.run_cycle().await;
        let forced = report.decision_for("ETHUSDT").unwrap();
        assert_eq!(forced.reason, Some(ExitReason::PortfolioProtection));
        assert_eq!(report.executed, 1);
        assert!(h.exchange.position("ETHUSDT").is_none());

        // Margin is back under the limit once the worst position is gone.
        h.clock.advance(Duration::minutes(1));
        let report = h.controller.run_cycle().await;
        assert_eq!(report.executed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_portfolio_guard_skips_smart_hold() {
        let h = harness(
            dec!(330),
            vec![
                position("BTCUSDT", dec!(93)),
                position("ETHUSDT", dec!(99)),
                position("SOLUSDT", dec!(101)),
            ],
        );
        h.signals.set(
            "BTCUSDT",
            SignalSnapshot {
                confidence: Some(0.8),
                win_probability: Some(0.6),
                rebound_probability: Some(0.85),
                trend: Some(Trend::new(Direction::Short, 0.9)),
            },
        );

        let report = h.controller.run_cycle().await;
        assert_eq!(
            report.decision_for("BTCUSDT").unwrap().reason,
            Some(ExitReason::SmartHold)
        );
        assert_eq!(
            report.decision_for("ETHUSDT").unwrap().reason,
            Some(ExitReason::PortfolioProtection)
        );
        assert_eq!(report.executed, 1);
        assert!(h.exchange.position("BTCUSDT").is_some());
        assert!(h.exchange.position("ETHUSDT").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_portfolio_close_does_not_start_cooldown() {
        let h = harness(
            dec!(330),
            vec![
                position("BTCUSDT", dec!(100)),
                position("ETHUSDT", dec!(97)),
                position("SOLUSDT", dec!(101)),
            ],
        );
        h.exchange.inject_failure(
            PaperOp::PlaceOrder,
            GatewayError::fatal(FatalKind::Rejected, "reduce-only rejected"),
        );

        let report = h.controller.run_cycle().await;
        assert_eq!(
            report.decision_for("ETHUSDT").unwrap().reason,
            Some(ExitReason::PortfolioProtection)
        );
        assert_eq!(report.failures, 1);

        h.clock.advance(Duration::minutes(1));
        let report = h.controller.run_cycle().await;
        assert_eq!(report.executed, 1);
        assert!(h.exchange.position("ETHUSDT").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_portfolio_decision_does_not_start_cooldown() {
        let mut h = harness(
            dec!(330),
            vec![
                position("BTCUSDT", dec!(100)),
                position("ETHUSDT", dec!(97)),
                position("SOLUSDT", dec!(101)),
            ],
        );
        h.controller = h.controller.with_dry_run(true);
        let report = h.controller.run_cycle().await;
        assert_eq!(
            report.decision_for("ETHUSDT").unwrap().reason,
            Some(ExitReason::PortfolioProtection)
        );
        assert_eq!(report.executed, 0);

        h.controller = h.controller.with_dry_run(false);
        h.clock.advance(Duration::minutes(1));
        let report = h.controller.run_cycle().await;
        assert_eq!(report.executed, 1);
        assert!(h.exchange.position("ETHUSDT").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_counts_entries() {
        let h = harness(dec!(10_000), vec![]);
        h.state.put("BTCUSDT", start()).unwrap();
        h.state.put("ETHUSDT", start()).unwrap();
        assert_eq!(h.controller.restore().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let h = harness(dec!(10_000), vec![]);
        let token = CancellationToken::new();
        token.cancel();
        h.controller.run(token).await;
    }
}
