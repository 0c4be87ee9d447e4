//! Core domain types for the vigil execution and risk engine.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - `Position`, `Direction`, `PositionStatus`: open leveraged positions
//! - `OperationRequest`, `Priority`, `OperationClass`: admission-control units
//! - `IdempotencyKey`: identifier carried by every mutating exchange call
//! - `ExitDecision`, `ExitAction`, `ExitReason`: output of position evaluation
//! - `Price`, `Size`: precision-safe numeric types

pub mod decimal;
pub mod error;
pub mod exit;
pub mod operation;
pub mod order;
pub mod position;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use exit::{ExitAction, ExitDecision, ExitReason};
pub use operation::{IdempotencyKey, OperationClass, OperationRequest, Priority};
pub use order::{Balance, OrderResult, OrderSide, OrderSpec};
pub use position::{Direction, Position, PositionStatus};
