//! In-memory paper exchange.
//!
//! Stands in for a real exchange in paper mode and tests:
//! - Orders fill immediately at the mark (or limit) price
//! - Reduce-only orders realize PnL and remove positions that reach zero
//! - A repeated idempotency key returns the first delivery's result
//! - Failures can be scripted per operation, before or after execution

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};
use vigil_core::{
    Balance, Direction, IdempotencyKey, OrderResult, OrderSide, OrderSpec, Position,
    PositionStatus, Price, Size,
};

use crate::error::{FatalKind, GatewayError, GatewayResult, RetryableKind};
use crate::gateway::{BoxFuture, ExchangeGateway, ExecutionReceipt};

/// Leverage applied to positions opened through the paper exchange.
const DEFAULT_LEVERAGE: Decimal = Decimal::TEN;

/// Paper exchange operation, used to target scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    PlaceOrder,
    CancelOrder,
    AmendProtection,
    FindOrder,
    GetPositions,
    GetBalance,
}

#[derive(Debug, Clone)]
enum ScriptedFailure {
    /// Fail without executing.
    Before(GatewayError),
    /// Execute, then lose the response (reported as a timeout).
    LostResponse,
}

#[derive(Debug, Default)]
struct PaperState {
    /// Cash balance, excluding unrealized PnL.
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    marks: HashMap<String, Price>,
    receipts: HashMap<IdempotencyKey, ExecutionReceipt>,
    /// Orders that actually executed, in order.
    executed: Vec<OrderSpec>,
    next_order_id: u64,
}

/// In-memory simulated exchange.
#[derive(Debug, Default)]
pub struct PaperExchange {
    state: Mutex<PaperState>,
    failures: Mutex<HashMap<PaperOp, VecDeque<ScriptedFailure>>>,
    latency: Mutex<Duration>,
}

impl PaperExchange {
    /// Create an exchange holding `equity` in cash and no positions.
    #[must_use]
    pub fn new(equity: Decimal) -> Self {
        let exchange = Self::default();
        exchange.state.lock().cash = equity;
        exchange
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Seed an open position. Its mark price becomes the symbol's mark.
    pub fn open_position(&self, position: Position) {
        let mut state = self.state.lock();
        state
            .marks
            .insert(position.symbol.clone(), position.mark_price);
        state.positions.insert(position.symbol.clone(), position);
    }

    pub fn set_mark(&self, symbol: &str, mark: Price) {
        self.state.lock().marks.insert(symbol.to_string(), mark);
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fail the next call of `op` with `error`, without executing it.
    pub fn inject_failure(&self, op: PaperOp, error: GatewayError) {
        self.failures
            .lock()
            .entry(op)
            .or_default()
            .push_back(ScriptedFailure::Before(error));
    }

    /// Execute the next call of `op` but report a timeout to the caller.
    pub fn inject_lost_response(&self, op: PaperOp) {
        self.failures
            .lock()
            .entry(op)
            .or_default()
            .push_back(ScriptedFailure::LostResponse);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Orders that executed (duplicates by key excluded).
    pub fn executed_orders(&self) -> Vec<OrderSpec> {
        self.state.lock().executed.clone()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        let state = self.state.lock();
        state
            .positions
            .get(symbol)
            .map(|p| with_mark(p, &state.marks))
    }

    // ------------------------------------------------------------------------
    // Simulation
    // ------------------------------------------------------------------------

    fn next_failure(&self, op: PaperOp) -> Option<ScriptedFailure> {
        self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front)
    }

    async fn simulate<T, F>(&self, op: PaperOp, call: F) -> GatewayResult<T>
    where
        F: FnOnce(&Self) -> GatewayResult<T>,
    {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.next_failure(op) {
            Some(ScriptedFailure::Before(error)) => {
                debug!(?op, %error, "Paper exchange: scripted failure");
                Err(error)
            }
            Some(ScriptedFailure::LostResponse) => {
                let _ = call(self)?;
                debug!(?op, "Paper exchange: executed, response lost");
                Err(GatewayError::retryable(
                    RetryableKind::Timeout,
                    "response lost after execution",
                ))
            }
            None => call(self),
        }
    }

    fn execute_order(&self, spec: &OrderSpec) -> GatewayResult<OrderResult> {
        let mut state = self.state.lock();
        if let Some(ExecutionReceipt::Filled(result)) = state.receipts.get(&spec.idempotency_key) {
            debug!(key = %spec.idempotency_key, "Paper exchange: duplicate order key");
            return Ok(result.clone());
        }

        if !spec.quantity.is_positive() {
            return Err(GatewayError::fatal(
                FatalKind::InvalidQuantity,
                format!("quantity must be positive, got {}", spec.quantity),
            ));
        }
        let mark = *state.marks.get(&spec.symbol).ok_or_else(|| {
            GatewayError::fatal(FatalKind::InvalidSymbol, format!("unknown symbol {}", spec.symbol))
        })?;
        let fill_price = spec.limit_price.unwrap_or(mark);

        let (filled_quantity, realized_pnl) = if spec.reduce_only {
            reduce_position(&mut state, spec, fill_price)?
        } else {
            open_new_position(&mut state, spec, fill_price)?
        };

        state.cash += realized_pnl;
        state.next_order_id += 1;
        let result = OrderResult {
            order_id: format!("paper-{}", state.next_order_id),
            idempotency_key: spec.idempotency_key.clone(),
            filled_quantity,
            average_price: fill_price,
            realized_pnl,
            filled_at: Utc::now(),
        };
        state.receipts.insert(
            spec.idempotency_key.clone(),
            ExecutionReceipt::Filled(result.clone()),
        );
        state.executed.push(spec.clone());

        info!(
            symbol = %spec.symbol,
            side = %spec.side,
            quantity = %filled_quantity,
            price = %fill_price,
            realized_pnl = %realized_pnl,
            reduce_only = spec.reduce_only,
            "Paper order filled"
        );
        Ok(result)
    }

    fn execute_amend(
        &self,
        symbol: &str,
        stop_loss: Price,
        take_profit: Price,
        key: &IdempotencyKey,
    ) -> GatewayResult<()> {
        let mut state = self.state.lock();
        if state.receipts.contains_key(key) {
            return Ok(());
        }
        let position = state.positions.get_mut(symbol).ok_or_else(|| {
            GatewayError::fatal(FatalKind::PositionNotFound, format!("no position for {symbol}"))
        })?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        state.receipts.insert(
            key.clone(),
            ExecutionReceipt::ProtectionAmended {
                symbol: symbol.to_string(),
                stop_loss,
                take_profit,
            },
        );
        Ok(())
    }

    fn execute_cancel(&self, order_id: &str, key: &IdempotencyKey) -> GatewayResult<()> {
        let state = self.state.lock();
        if state.receipts.contains_key(key) {
            return Ok(());
        }
        let filled = state
            .receipts
            .values()
            .any(|r| matches!(r, ExecutionReceipt::Filled(o) if o.order_id == order_id));
        // Paper orders fill on arrival, so nothing is ever resting.
        let message = if filled {
            format!("order {order_id} already filled")
        } else {
            format!("unknown order {order_id}")
        };
        Err(GatewayError::fatal(FatalKind::Rejected, message))
    }

    fn snapshot_positions(&self) -> Vec<Position> {
        let state = self.state.lock();
        state
            .positions
            .values()
            .map(|p| with_mark(p, &state.marks))
            .collect()
    }

    fn snapshot_balance(&self) -> Balance {
        let state = self.state.lock();
        let mut unrealized = Decimal::ZERO;
        let mut margin_used = Decimal::ZERO;
        for position in state.positions.values() {
            unrealized += with_mark(position, &state.marks).unrealized_pnl();
            margin_used += position.margin_used;
        }
        let equity = state.cash + unrealized;
        Balance {
            equity,
            available: (equity - margin_used).max(Decimal::ZERO),
            margin_used,
        }
    }
}

fn with_mark(position: &Position, marks: &HashMap<String, Price>) -> Position {
    let mut snapshot = position.clone();
    if let Some(mark) = marks.get(&position.symbol) {
        snapshot.mark_price = *mark;
    }
    snapshot
}

fn reduce_position(
    state: &mut PaperState,
    spec: &OrderSpec,
    fill_price: Price,
) -> GatewayResult<(Size, Decimal)> {
    let position = state
        .positions
        .get_mut(&spec.symbol)
        .filter(|p| p.direction.closing_side() == spec.side)
        .ok_or_else(|| {
            GatewayError::fatal(
                FatalKind::PositionNotFound,
                format!("no {} position to reduce on {}", spec.side, spec.symbol),
            )
        })?;

    let quantity = spec.quantity.min(position.quantity);
    let realized = (fill_price.inner() - position.entry_price.inner())
        * quantity.inner()
        * position.direction.sign();

    let remaining = position.quantity.saturating_sub(quantity);
    if remaining.is_zero() {
        state.positions.remove(&spec.symbol);
    } else {
        let kept = remaining.inner() / position.quantity.inner();
        position.margin_used *= kept;
        position.quantity = remaining;
        position.realized_pnl += realized;
    }
    Ok((quantity, realized))
}

fn open_new_position(
    state: &mut PaperState,
    spec: &OrderSpec,
    fill_price: Price,
) -> GatewayResult<(Size, Decimal)> {
    if state.positions.contains_key(&spec.symbol) {
        return Err(GatewayError::fatal(
            FatalKind::Rejected,
            format!("position already open on {}", spec.symbol),
        ));
    }

    let margin = spec.quantity.notional(fill_price) / DEFAULT_LEVERAGE;
    let margin_in_use: Decimal = state.positions.values().map(|p| p.margin_used).sum();
    if state.cash - margin_in_use < margin {
        return Err(GatewayError::fatal(
            FatalKind::InsufficientMargin,
            format!("margin {margin} exceeds available balance"),
        ));
    }

    let direction = match spec.side {
        OrderSide::Buy => Direction::Long,
        OrderSide::Sell => Direction::Short,
    };
    state.positions.insert(
        spec.symbol.clone(),
        Position {
            symbol: spec.symbol.clone(),
            direction,
            entry_price: fill_price,
            quantity: spec.quantity,
            leverage: DEFAULT_LEVERAGE,
            stop_loss: Price::ZERO,
            take_profit: Price::ZERO,
            margin_used: margin,
            entry_time: Utc::now(),
            status: PositionStatus::Open,
            mark_price: fill_price,
            realized_pnl: Decimal::ZERO,
        },
    );
    Ok((spec.quantity, Decimal::ZERO))
}

impl ExchangeGateway for PaperExchange {
    fn place_order(&self, spec: OrderSpec) -> BoxFuture<'_, GatewayResult<OrderResult>> {
        Box::pin(async move {
            self.simulate(PaperOp::PlaceOrder, |ex| ex.execute_order(&spec))
                .await
        })
    }

    fn cancel_order(
        &self,
        order_id: String,
        idempotency_key: IdempotencyKey,
    ) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.simulate(PaperOp::CancelOrder, |ex| {
                ex.execute_cancel(&order_id, &idempotency_key)
            })
            .await
        })
    }

    fn amend_protection(
        &self,
        symbol: String,
        stop_loss: Price,
        take_profit: Price,
        idempotency_key: IdempotencyKey,
    ) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.simulate(PaperOp::AmendProtection, |ex| {
                ex.execute_amend(&symbol, stop_loss, take_profit, &idempotency_key)
            })
            .await
        })
    }

    fn find_order(
        &self,
        idempotency_key: IdempotencyKey,
    ) -> BoxFuture<'_, GatewayResult<Option<ExecutionReceipt>>> {
        Box::pin(async move {
            self.simulate(PaperOp::FindOrder, |ex| {
                Ok(ex.state.lock().receipts.get(&idempotency_key).cloned())
            })
            .await
        })
    }

    fn get_positions(&self) -> BoxFuture<'_, GatewayResult<Vec<Position>>> {
        Box::pin(async move {
            self.simulate(PaperOp::GetPositions, |ex| Ok(ex.snapshot_positions()))
                .await
        })
    }

    fn get_account_balance(&self) -> BoxFuture<'_, GatewayResult<Balance>> {
        Box::pin(async move {
            self.simulate(PaperOp::GetBalance, |ex| Ok(ex.snapshot_balance()))
                .await
        })
    }
}
