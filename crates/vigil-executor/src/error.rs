//! Executor error types.
//!
//! Gateway errors arrive pre-classified: the coordinator only needs to
//! know whether an error is worth retrying, never exchange error codes.

use std::fmt;
use thiserror::Error;

/// Transport conditions that may clear on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryableKind {
    Timeout,
    RateLimited,
    Network,
}

impl RetryableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for RetryableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order errors that will fail again if retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalKind {
    InsufficientMargin,
    InvalidSymbol,
    InvalidQuantity,
    /// The position is already closed (or never existed).
    PositionNotFound,
    Rejected,
}

impl FatalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientMargin => "insufficient_margin",
            Self::InvalidSymbol => "invalid_symbol",
            Self::InvalidQuantity => "invalid_quantity",
            Self::PositionNotFound => "position_not_found",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-classified exchange error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Retryable gateway error ({kind}): {message}")]
    Retryable { kind: RetryableKind, message: String },

    #[error("Fatal gateway error ({kind}): {message}")]
    Fatal { kind: FatalKind, message: String },
}

impl GatewayError {
    pub fn retryable(kind: RetryableKind, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// The position this call targeted no longer exists.
    #[must_use]
    pub fn is_position_not_found(&self) -> bool {
        matches!(
            self,
            Self::Fatal {
                kind: FatalKind::PositionNotFound,
                ..
            }
        )
    }

    /// Metric label for the error kind.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Retryable { kind, .. } => kind.as_str(),
            Self::Fatal { kind, .. } => kind.as_str(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Executor construction errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Admission error: {0}")]
    Admission(#[from] vigil_admission::AdmissionError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
