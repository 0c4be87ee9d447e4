//! Vigil execution and position-risk service.
//!
//! Wires the components together:
//! - Admission control (graded circuit breaker + token bucket)
//! - Execution coordinator over the paper exchange
//! - Durable entry times, partial-close markers and exit log
//! - Position risk controller loop with graceful shutdown

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::{AppConfig, OperatingMode};
pub use error::{AppError, AppResult};
