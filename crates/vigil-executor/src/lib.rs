//! Admission-controlled execution of exchange calls.
//!
//! # Key Components
//!
//! - [`ExecutionCoordinator`]: the only writer of exchange-mutating calls
//! - [`ExchangeGateway`]: dyn-compatible exchange interface with pre-classified errors
//! - [`PaperExchange`]: in-memory gateway for paper mode and tests
//! - [`RetryPolicy`]: bounded exponential backoff for retryable errors
//! - [`InflightTracker`]: counts running executions so shutdown can drain them
//!
//! # Execution order (in `ExecutionCoordinator::execute`)
//!
//! 1. Completed key -> answered from cache
//! 2. Breaker denies -> `ExecutionOutcome::Blocked`
//! 3. Breaker throttles -> sleep `wait_hint`
//! 4. Per attempt: `find_order` (re-sends only) -> limiter -> call with timeout
//! 5. Terminal outcome -> breaker success/failure

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod inflight;
pub mod paper;
pub mod retry;

pub use config::ExecutorConfig;
pub use coordinator::{ExecutionCoordinator, ExecutionOutcome, Payload, QueryError};
pub use error::{ExecutorError, ExecutorResult, FatalKind, GatewayError, GatewayResult, RetryableKind};
pub use gateway::{BoxFuture, DynGateway, ExchangeGateway, ExecutionReceipt};
pub use inflight::{InflightGuard, InflightTracker};
pub use paper::{PaperExchange, PaperOp};
pub use retry::RetryPolicy;
