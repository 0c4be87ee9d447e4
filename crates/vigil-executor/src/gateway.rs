//! Exchange gateway trait.
//!
//! Provides a trait-based abstraction over the exchange so that:
//! - the coordinator can be tested against the paper exchange
//! - the wire protocol stays outside this workspace

use std::pin::Pin;
use std::sync::Arc;

use vigil_core::{Balance, IdempotencyKey, OrderResult, OrderSpec, Position, Price};

use crate::error::GatewayResult;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Proof that a mutating call executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionReceipt {
    /// An order filled (opening or reducing).
    Filled(OrderResult),
    Cancelled { order_id: String },
    ProtectionAmended {
        symbol: String,
        stop_loss: Price,
        take_profit: Price,
    },
}

impl ExecutionReceipt {
    /// Fill details, if this receipt is for an order.
    #[must_use]
    pub fn fill(&self) -> Option<&OrderResult> {
        match self {
            Self::Filled(result) => Some(result),
            _ => None,
        }
    }
}

/// Exchange operations consumed by the coordinator.
///
/// Every mutating call carries the idempotency key of its request; a
/// gateway must treat a second delivery of the same key as the first.
pub trait ExchangeGateway: Send + Sync {
    fn place_order(&self, spec: OrderSpec) -> BoxFuture<'_, GatewayResult<OrderResult>>;

    fn cancel_order(
        &self,
        order_id: String,
        idempotency_key: IdempotencyKey,
    ) -> BoxFuture<'_, GatewayResult<()>>;

    /// Move the stop-loss / take-profit of an open position.
    fn amend_protection(
        &self,
        symbol: String,
        stop_loss: Price,
        take_profit: Price,
        idempotency_key: IdempotencyKey,
    ) -> BoxFuture<'_, GatewayResult<()>>;

    /// Look up whether a request with this key already executed.
    fn find_order(
        &self,
        idempotency_key: IdempotencyKey,
    ) -> BoxFuture<'_, GatewayResult<Option<ExecutionReceipt>>>;

    fn get_positions(&self) -> BoxFuture<'_, GatewayResult<Vec<Position>>>;

    fn get_account_balance(&self) -> BoxFuture<'_, GatewayResult<Balance>>;
}

/// Shared gateway handle.
pub type DynGateway = Arc<dyn ExchangeGateway>;
