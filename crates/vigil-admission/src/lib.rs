//! Admission control for outbound exchange calls.
//!
//! Every exchange call passes through two gates before it is sent:
//! - `GradedCircuitBreaker`: degrades admission NORMAL -> WARNING ->
//!   THROTTLED -> BLOCKED as failures accumulate, with priority bypass so
//!   risk-reducing closes keep working while new orders are stopped
//! - `TokenBucketLimiter`: bounds the outbound call rate

pub mod breaker;
pub mod config;
pub mod error;
pub mod limiter;

pub use breaker::{
    Admission, AuditEvent, BypassRecord, CircuitLevel, CircuitSnapshot, GradedCircuitBreaker,
};
pub use config::{BreakerConfig, LimiterConfig};
pub use error::{AdmissionError, AdmissionResult};
pub use limiter::TokenBucketLimiter;
