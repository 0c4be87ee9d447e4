//! Admission-control request types.
//!
//! Every exchange-mutating call is described by exactly one
//! [`OperationRequest`] before it is sent: the class of operation, its
//! priority, and the idempotency key that lets a retried delivery be
//! recognized instead of executed twice.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

/// Request priority. Ordered: `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    /// Risk-reducing actions that must never be stopped by admission control.
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical class of an outbound exchange operation.
///
/// The circuit breaker tracks failure history per class and the bypass
/// whitelist is expressed in terms of classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Opening a new position.
    PlaceOrder,
    /// Reducing or closing an existing position.
    ClosePosition,
    /// Cancelling a resting order.
    CancelOrder,
    /// Moving stop-loss / take-profit levels.
    AdjustProtection,
    /// Read-only call (positions, balance).
    Query,
}

impl OperationClass {
    pub const ALL: [OperationClass; 5] = [
        Self::PlaceOrder,
        Self::ClosePosition,
        Self::CancelOrder,
        Self::AdjustProtection,
        Self::Query,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlaceOrder => "place_order",
            Self::ClosePosition => "close_position",
            Self::CancelOrder => "cancel_order",
            Self::AdjustProtection => "adjust_protection",
            Self::Query => "query",
        }
    }

    /// Whether operations of this class change exchange state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Query)
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::UnknownOperationClass(s.to_string()))
    }
}

/// Idempotency key attached to every mutating request.
///
/// A key is either fresh (unique per logical request) or derived
/// deterministically from a position and a purpose, so that the same
/// logical action issued again after a crash carries the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Create a new unique key.
    ///
    /// Format: `vgl_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("vgl_{ts}_{uuid_short}"))
    }

    /// Deterministic key for a one-shot action on a position.
    pub fn derived(position_id: &str, purpose: &str) -> Self {
        Self(format!("vgl_{purpose}_{position_id}"))
    }

    /// Wrap an existing key (e.g. read back from storage).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for IdempotencyKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One admission-control decision unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation_class: OperationClass,
    pub priority: Priority,
    pub idempotency_key: IdempotencyKey,
}

impl OperationRequest {
    /// Create a request with a fresh idempotency key.
    pub fn new(operation_class: OperationClass, priority: Priority) -> Self {
        Self {
            operation_class,
            priority,
            idempotency_key: IdempotencyKey::new(),
        }
    }

    /// Create a request carrying a caller-supplied key.
    pub fn with_key(
        operation_class: OperationClass,
        priority: Priority,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            operation_class,
            priority,
            idempotency_key,
        }
    }
}
