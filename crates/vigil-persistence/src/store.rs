//! Store interfaces and the records they hold.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use vigil_core::{ExitReason, IdempotencyKey, Price, Size};

use crate::error::PersistenceResult;

// ============================================================================
// Entry times
// ============================================================================

/// Durable record of when each open position was entered, keyed by symbol.
///
/// Implementations that lose data on restart must return `false` from
/// `is_durable`; the time stop cannot be trusted on top of them.
pub trait EntryTimeStore: Send + Sync {
    fn get(&self, symbol: &str) -> PersistenceResult<Option<DateTime<Utc>>>;

    fn put(&self, symbol: &str, entry_time: DateTime<Utc>) -> PersistenceResult<()>;

    fn delete(&self, symbol: &str) -> PersistenceResult<()>;

    /// Every stored `(symbol, entry_time)` pair.
    fn entries(&self) -> PersistenceResult<Vec<(String, DateTime<Utc>)>>;

    /// Whether stored values survive a process restart.
    fn is_durable(&self) -> bool;
}

// ============================================================================
// Initial risk
// ============================================================================

/// Risk of each open position as first observed, keyed by symbol.
///
/// Recorded once; later stop trails and partial closes must not change the
/// loss ratio's denominator.
pub trait InitialRiskStore: Send + Sync {
    fn get_risk(&self, symbol: &str) -> PersistenceResult<Option<Decimal>>;

    fn put_risk(&self, symbol: &str, risk: Decimal) -> PersistenceResult<()>;

    fn delete_risk(&self, symbol: &str) -> PersistenceResult<()>;
}

// ============================================================================
// Partial close markers
// ============================================================================

/// Progress of the one-shot partial close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerState {
    /// Written before the order is sent; the order may or may not have executed.
    Pending,
    /// The partial close executed.
    Done,
}

/// Per-position marker for the partial profit lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCloseMarker {
    /// Position the marker belongs to (`symbol@entry_ms`).
    pub position_id: String,
    /// Key the partial close order is (re)sent with.
    pub idempotency_key: IdempotencyKey,
    /// Fraction of the quantity the close was decided with.
    pub fraction: Decimal,
    pub state: MarkerState,
    pub updated_at: DateTime<Utc>,
}

impl PartialCloseMarker {
    #[must_use]
    pub fn pending(
        position_id: impl Into<String>,
        idempotency_key: IdempotencyKey,
        fraction: Decimal,
    ) -> Self {
        Self {
            position_id: position_id.into(),
            idempotency_key,
            fraction,
            state: MarkerState::Pending,
            updated_at: Utc::now(),
        }
    }

    /// Same marker, flipped to `Done`.
    #[must_use]
    pub fn completed(&self) -> Self {
        Self {
            state: MarkerState::Done,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == MarkerState::Done
    }
}

/// Durable partial close markers, keyed by symbol.
pub trait PartialCloseStore: Send + Sync {
    fn get_marker(&self, symbol: &str) -> PersistenceResult<Option<PartialCloseMarker>>;

    fn put_marker(&self, symbol: &str, marker: PartialCloseMarker) -> PersistenceResult<()>;

    fn delete_marker(&self, symbol: &str) -> PersistenceResult<()>;
}

// ============================================================================
// Trade exits
// ============================================================================

/// One terminal close, as written to the trade log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub position_id: String,
    pub symbol: String,
    pub reason: ExitReason,
    /// Total realized PnL of the position, partial closes included.
    pub realized_pnl: Decimal,
    pub quantity: Size,
    pub exit_price: Price,
    pub closed_at: DateTime<Utc>,
}

impl ExitRecord {
    /// Deduplication key: position id plus close timestamp.
    pub fn dedupe_key(&self) -> (String, i64) {
        (self.position_id.clone(), self.closed_at.timestamp_millis())
    }
}

/// Append-only log of terminal exits, tolerant of at-least-once delivery.
pub trait TradeStore: Send + Sync {
    /// Record an exit. Returns `false` if the same `(position_id, closed_at)`
    /// was already recorded.
    fn record_exit(&self, record: &ExitRecord) -> PersistenceResult<bool>;

    /// Every recorded exit, oldest first.
    fn exits(&self) -> PersistenceResult<Vec<ExitRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_marker_completed_keeps_key() {
        let key = IdempotencyKey::derived("ETH@1", "partial_profit_lock");
        let pending = PartialCloseMarker::pending("ETH@1", key.clone(), dec!(0.5));
        assert!(!pending.is_done());

        let done = pending.completed();
        assert!(done.is_done());
        assert_eq!(done.idempotency_key, key);
        assert_eq!(done.position_id, "ETH@1");
    }
}
