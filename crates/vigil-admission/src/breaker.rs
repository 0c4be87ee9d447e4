//! Graded circuit breaker with priority bypass.
//!
//! Failure history is tracked per operation class (or globally) and maps
//! to one of four levels:
//!
//! | level     | admission                                             |
//! |-----------|-------------------------------------------------------|
//! | NORMAL    | allowed                                               |
//! | WARNING   | allowed                                               |
//! | THROTTLED | allowed after `throttle_delay`                        |
//! | BLOCKED   | only whitelisted classes or CRITICAL priority         |
//!
//! A scope with no new failure for `breaker_timeout` resets fully to
//! NORMAL with a zero count. The reset is evaluated lazily on every read
//! and write, so a level is never reported stale.
//!
//! Every bypass grant, every BLOCKED denial and every level transition is
//! logged, counted and appended to a bounded in-memory audit journal.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use vigil_core::{OperationClass, Priority};
use vigil_telemetry::Metrics;

use crate::config::BreakerConfig;
use crate::error::AdmissionResult;

// ============================================================================
// CircuitLevel
// ============================================================================

/// Degradation level. Ordered: `Normal < Warning < Throttled < Blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitLevel {
    Normal,
    Warning,
    Throttled,
    Blocked,
}

impl CircuitLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Throttled => "throttled",
            Self::Blocked => "blocked",
        }
    }

    /// Numeric encoding for the level gauge.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Warning => 1,
            Self::Throttled => 2,
            Self::Blocked => 3,
        }
    }

    /// Level for a failure count. Pure and monotonic in `failure_count`.
    fn from_count(failure_count: u32, config: &BreakerConfig) -> Self {
        if failure_count >= config.blocked_threshold {
            Self::Blocked
        } else if failure_count >= config.throttled_threshold {
            Self::Throttled
        } else if failure_count >= config.warning_threshold {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for CircuitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Admission / audit types
// ============================================================================

/// Result of `can_proceed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Delay the caller must sleep before sending.
    pub wait_hint: Option<Duration>,
    /// Level of the scope at decision time.
    pub level: CircuitLevel,
    /// Whether admission was granted only through the BLOCKED bypass.
    pub bypassed: bool,
}

/// One bypass grant while BLOCKED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BypassRecord {
    pub operation_class: OperationClass,
    pub priority: Priority,
    pub level: CircuitLevel,
    pub granted_at: DateTime<Utc>,
}

/// Audit journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Bypass(BypassRecord),
    Denied {
        operation_class: OperationClass,
        priority: Priority,
        at: DateTime<Utc>,
    },
    Transition {
        scope: String,
        from: CircuitLevel,
        to: CircuitLevel,
        failure_count: u32,
        at: DateTime<Utc>,
    },
}

/// Point-in-time view of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub failure_count: u32,
    pub level: CircuitLevel,
    pub last_failure_time: Option<Instant>,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Global,
    Class(OperationClass),
}

impl Scope {
    fn label(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Class(class) => class.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CircuitState {
    failure_count: u32,
    level: CircuitLevel,
    last_failure_time: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            failure_count: 0,
            level: CircuitLevel::Normal,
            last_failure_time: None,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerInner {
    scopes: HashMap<Scope, CircuitState>,
    journal: VecDeque<AuditEvent>,
}

// ============================================================================
// GradedCircuitBreaker
// ============================================================================

/// Process-wide graded circuit breaker.
///
/// All state sits behind one mutex so that count changes and level
/// recomputation are atomic with respect to each other. The lock is never
/// held across an `.await`.
pub struct GradedCircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl GradedCircuitBreaker {
    /// Create a breaker from validated configuration.
    pub fn new(config: BreakerConfig) -> AdmissionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(BreakerInner::default()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Decide whether a request may be sent.
    ///
    /// # Arguments
    /// * `priority` - Request priority; CRITICAL bypasses BLOCKED
    /// * `operation_class` - Class whose failure history applies
    pub fn can_proceed(&self, priority: Priority, operation_class: OperationClass) -> Admission {
        let scope = self.scope_for(operation_class);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let level = self.refresh(&mut inner, scope, now);

        match level {
            CircuitLevel::Normal | CircuitLevel::Warning => Admission {
                allowed: true,
                wait_hint: None,
                level,
                bypassed: false,
            },
            CircuitLevel::Throttled => Admission {
                allowed: true,
                wait_hint: Some(self.config.throttle_delay()),
                level,
                bypassed: false,
            },
            CircuitLevel::Blocked => {
                let whitelisted = self.config.bypass_whitelist.contains(&operation_class);
                if whitelisted || priority == Priority::Critical {
                    let record = BypassRecord {
                        operation_class,
                        priority,
                        level,
                        granted_at: Utc::now(),
                    };
                    warn!(
                        class = %operation_class,
                        priority = %priority,
                        whitelisted,
                        "Circuit breaker BLOCKED: bypass granted"
                    );
                    Metrics::admission_bypass(operation_class.as_str(), priority.as_str());
                    self.journal(&mut inner, AuditEvent::Bypass(record));
                    Admission {
                        allowed: true,
                        wait_hint: None,
                        level,
                        bypassed: true,
                    }
                } else {
                    warn!(
                        class = %operation_class,
                        priority = %priority,
                        "Circuit breaker BLOCKED: request denied"
                    );
                    Metrics::admission_denied(operation_class.as_str(), priority.as_str());
                    self.journal(
                        &mut inner,
                        AuditEvent::Denied {
                            operation_class,
                            priority,
                            at: Utc::now(),
                        },
                    );
                    Admission {
                        allowed: false,
                        wait_hint: None,
                        level,
                        bypassed: false,
                    }
                }
            }
        }
    }

    /// Record a successful call. Decrements the count when decay is enabled.
    pub fn record_success(&self, operation_class: OperationClass) {
        let scope = self.scope_for(operation_class);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, scope, now);

        if !self.config.decay_on_success {
            return;
        }
        let state = inner.scopes.entry(scope).or_default();
        if state.failure_count == 0 {
            return;
        }
        state.failure_count -= 1;
        self.recompute(&mut inner, scope);
    }

    /// Record a failed call: increment, stamp, recompute.
    pub fn record_failure(&self, operation_class: OperationClass) {
        let scope = self.scope_for(operation_class);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, scope, now);

        let state = inner.scopes.entry(scope).or_default();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_time = Some(now);
        self.recompute(&mut inner, scope);
    }

    /// Current level for a class (after lazy timeout reset).
    pub fn level(&self, operation_class: OperationClass) -> CircuitLevel {
        self.snapshot(operation_class).level
    }

    /// Current failure count for a class (after lazy timeout reset).
    pub fn failure_count(&self, operation_class: OperationClass) -> u32 {
        self.snapshot(operation_class).failure_count
    }

    pub fn snapshot(&self, operation_class: OperationClass) -> CircuitSnapshot {
        let scope = self.scope_for(operation_class);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, scope, now);
        let state = inner.scopes.get(&scope).copied().unwrap_or_default();
        CircuitSnapshot {
            failure_count: state.failure_count,
            level: state.level,
            last_failure_time: state.last_failure_time,
        }
    }

    /// Copy of the audit journal, oldest first.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.lock().journal.iter().cloned().collect()
    }

    /// Bypass grants in the audit journal, oldest first.
    pub fn bypass_records(&self) -> Vec<BypassRecord> {
        self.inner
            .lock()
            .journal
            .iter()
            .filter_map(|event| match event {
                AuditEvent::Bypass(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Internals (caller holds the lock)
    // ------------------------------------------------------------------------

    fn scope_for(&self, operation_class: OperationClass) -> Scope {
        if self.config.per_class {
            Scope::Class(operation_class)
        } else {
            Scope::Global
        }
    }

    /// Apply the timeout reset if due and return the current level.
    fn refresh(&self, inner: &mut BreakerInner, scope: Scope, now: Instant) -> CircuitLevel {
        let timeout = self.config.timeout();
        let Some(state) = inner.scopes.get_mut(&scope) else {
            return CircuitLevel::Normal;
        };

        let expired = state.failure_count > 0
            && state
                .last_failure_time
                .is_some_and(|t| now.saturating_duration_since(t) > timeout);
        if !expired {
            return state.level;
        }

        let from = state.level;
        let cleared = state.failure_count;
        *state = CircuitState::default();
        info!(
            scope = scope.label(),
            from = %from,
            cleared_failures = cleared,
            "Circuit breaker timed out, reset to NORMAL"
        );
        Metrics::breaker_state(scope.label(), CircuitLevel::Normal.as_u8(), 0);
        if from != CircuitLevel::Normal {
            self.transition(inner, scope, from, CircuitLevel::Normal, 0);
        }
        CircuitLevel::Normal
    }

    /// Recompute the level from the count and journal any transition.
    fn recompute(&self, inner: &mut BreakerInner, scope: Scope) {
        let Some(state) = inner.scopes.get_mut(&scope) else {
            return;
        };
        let from = state.level;
        let to = CircuitLevel::from_count(state.failure_count, &self.config);
        state.level = to;
        let count = state.failure_count;

        Metrics::breaker_state(scope.label(), to.as_u8(), count);
        if from != to {
            self.transition(inner, scope, from, to, count);
        }
    }

    fn transition(
        &self,
        inner: &mut BreakerInner,
        scope: Scope,
        from: CircuitLevel,
        to: CircuitLevel,
        failure_count: u32,
    ) {
        if to == CircuitLevel::Blocked {
            error!(
                scope = scope.label(),
                from = %from,
                failure_count,
                "Circuit breaker BLOCKED"
            );
        } else {
            warn!(
                scope = scope.label(),
                from = %from,
                to = %to,
                failure_count,
                "Circuit breaker level changed"
            );
        }
        Metrics::breaker_transition(scope.label(), to.as_str());
        self.journal(
            inner,
            AuditEvent::Transition {
                scope: scope.label().to_string(),
                from,
                to,
                failure_count,
                at: Utc::now(),
            },
        );
    }

    fn journal(&self, inner: &mut BreakerInner, event: AuditEvent) {
        if self.config.journal_capacity == 0 {
            return;
        }
        while inner.journal.len() >= self.config.journal_capacity {
            inner.journal.pop_front();
        }
        inner.journal.push_back(event);
    }
}

impl fmt::Debug for GradedCircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradedCircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(warning: u32, throttled: u32, blocked: u32) -> GradedCircuitBreaker {
        GradedCircuitBreaker::new(BreakerConfig::with_thresholds(warning, throttled, blocked))
            .unwrap()
    }

    fn fail(breaker: &GradedCircuitBreaker, class: OperationClass, n: u32) {
        for _ in 0..n {
            breaker.record_failure(class);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_levels_follow_thresholds() {
        let cb = breaker(2, 4, 5);
        let class = OperationClass::PlaceOrder;

        assert_eq!(cb.level(class), CircuitLevel::Normal);
        fail(&cb, class, 1);
        assert_eq!(cb.level(class), CircuitLevel::Normal);
        fail(&cb, class, 1);
        assert_eq!(cb.level(class), CircuitLevel::Warning);
        fail(&cb, class, 2);
        assert_eq!(cb.level(class), CircuitLevel::Throttled);
        fail(&cb, class, 1);
        assert_eq!(cb.level(class), CircuitLevel::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_denies_normal_and_admits_critical() {
        let cb = GradedCircuitBreaker::new(BreakerConfig {
            per_class: false,
            ..BreakerConfig::with_thresholds(2, 4, 5)
        })
        .unwrap();
        fail(&cb, OperationClass::PlaceOrder, 5);

        let query = cb.can_proceed(Priority::Normal, OperationClass::Query);
        assert!(!query.allowed);
        assert_eq!(query.level, CircuitLevel::Blocked);

        let close = cb.can_proceed(Priority::Critical, OperationClass::ClosePosition);
        assert!(close.allowed);
        assert!(close.bypassed);
        assert!(close.wait_hint.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitelisted_class_bypasses_at_any_priority() {
        let cb = GradedCircuitBreaker::new(BreakerConfig {
            bypass_whitelist: vec![OperationClass::CancelOrder],
            ..BreakerConfig::with_thresholds(1, 2, 3)
        })
        .unwrap();
        fail(&cb, OperationClass::CancelOrder, 3);

        let admission = cb.can_proceed(Priority::Low, OperationClass::CancelOrder);
        assert!(admission.allowed);
        assert!(admission.bypassed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_bypass_is_recorded() {
        let cb = breaker(2, 4, 5);
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 5);

        assert!(!cb.can_proceed(Priority::High, class).allowed);
        assert!(cb.can_proceed(Priority::Critical, class).allowed);

        let records = cb.bypass_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_class, class);
        assert_eq!(records[0].priority, Priority::Critical);
        assert_eq!(records[0].level, CircuitLevel::Blocked);

        let denials = cb
            .audit_events()
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::Denied { .. }))
            .count();
        assert_eq!(denials, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_returns_wait_hint() {
        let cb = breaker(2, 4, 5);
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 4);

        let admission = cb.can_proceed(Priority::Normal, class);
        assert!(admission.allowed);
        assert_eq!(admission.wait_hint, Some(cb.config().throttle_delay()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resets_to_normal() {
        let cb = breaker(2, 4, 5);
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 5);
        assert_eq!(cb.level(class), CircuitLevel::Blocked);

        tokio::time::advance(cb.config().timeout()).await;
        // Not yet strictly past the timeout.
        assert_eq!(cb.level(class), CircuitLevel::Blocked);

        tokio::time::advance(Duration::from_millis(1)).await;
        let snapshot = cb.snapshot(class);
        assert_eq!(snapshot.level, CircuitLevel::Normal);
        assert_eq!(snapshot.failure_count, 0);
        assert!(cb.can_proceed(Priority::Normal, class).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_failure_restarts_timeout_window() {
        let cb = breaker(2, 4, 5);
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 4);

        tokio::time::advance(Duration::from_secs(200)).await;
        fail(&cb, class, 1);
        tokio::time::advance(Duration::from_secs(200)).await;

        // 400s since the first failures, 200s since the last one.
        assert_eq!(cb.level(class), CircuitLevel::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decays_one_step() {
        let cb = breaker(2, 4, 5);
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 4);
        assert_eq!(cb.level(class), CircuitLevel::Throttled);

        cb.record_success(class);
        assert_eq!(cb.failure_count(class), 3);
        assert_eq!(cb.level(class), CircuitLevel::Warning);

        for _ in 0..10 {
            cb.record_success(class);
        }
        assert_eq!(cb.failure_count(class), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_without_decay_keeps_count() {
        let cb = GradedCircuitBreaker::new(BreakerConfig {
            decay_on_success: false,
            ..BreakerConfig::with_thresholds(2, 4, 5)
        })
        .unwrap();
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 3);
        cb.record_success(class);
        assert_eq!(cb.failure_count(class), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_class_isolation() {
        let cb = breaker(2, 4, 5);
        fail(&cb, OperationClass::PlaceOrder, 5);

        assert_eq!(cb.level(OperationClass::PlaceOrder), CircuitLevel::Blocked);
        assert_eq!(cb.level(OperationClass::Query), CircuitLevel::Normal);
        assert!(cb.can_proceed(Priority::Normal, OperationClass::Query).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_journaled() {
        let cb = breaker(2, 4, 5);
        fail(&cb, OperationClass::PlaceOrder, 5);

        let targets: Vec<CircuitLevel> = cb
            .audit_events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::Transition { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            targets,
            vec![
                CircuitLevel::Warning,
                CircuitLevel::Throttled,
                CircuitLevel::Blocked
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_is_bounded() {
        let cb = GradedCircuitBreaker::new(BreakerConfig {
            journal_capacity: 4,
            ..BreakerConfig::with_thresholds(1, 2, 3)
        })
        .unwrap();
        let class = OperationClass::PlaceOrder;
        fail(&cb, class, 3);
        for _ in 0..10 {
            cb.can_proceed(Priority::Critical, class);
        }
        assert_eq!(cb.audit_events().len(), 4);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        assert!(GradedCircuitBreaker::new(BreakerConfig::with_thresholds(5, 4, 2)).is_err());
    }
}
