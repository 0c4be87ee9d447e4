//! Prometheus metrics for vigil.
//!
//! Covers:
//! - Circuit breaker level, failure count, transitions
//! - Admission denials and bypass grants
//! - Rate limiter tokens and wait time
//! - Execution outcomes and retries
//! - Exit decisions and monitor cycles
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_int_gauge, CounterVec, Gauge, GaugeVec, Histogram, IntGauge,
};

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Breaker level per scope (0=normal, 1=warning, 2=throttled, 3=blocked).
/// Labels: scope (operation class, or "global")
pub static BREAKER_LEVEL: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "vigil_breaker_level",
        "Circuit breaker level (0=normal, 1=warning, 2=throttled, 3=blocked)",
        &["scope"]
    )
    .unwrap()
});

/// Breaker failure count per scope.
pub static BREAKER_FAILURES: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "vigil_breaker_failures",
        "Circuit breaker failure count",
        &["scope"]
    )
    .unwrap()
});

/// Breaker level transitions.
/// Labels: scope, to (normal/warning/throttled/blocked)
pub static BREAKER_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_breaker_transitions_total",
        "Total circuit breaker level transitions",
        &["scope", "to"]
    )
    .unwrap()
});

/// Requests denied by admission control.
pub static ADMISSION_DENIED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_admission_denied_total",
        "Total requests denied while the breaker is blocked",
        &["class", "priority"]
    )
    .unwrap()
});

/// Requests admitted through a blocked breaker.
pub static ADMISSION_BYPASS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_admission_bypass_total",
        "Total requests admitted through a blocked breaker",
        &["class", "priority"]
    )
    .unwrap()
});

// =============================================================================
// Rate Limiter
// =============================================================================

/// Tokens currently available in the bucket.
pub static LIMITER_TOKENS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "vigil_limiter_tokens",
        "Tokens currently available in the rate limiter bucket"
    )
    .unwrap()
});

/// Time spent waiting for a token, in milliseconds.
pub static LIMITER_WAIT_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "vigil_limiter_wait_ms",
        "Time spent waiting for a rate limiter token in milliseconds",
        vec![0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

// =============================================================================
// Execution
// =============================================================================

/// Terminal execution outcomes.
/// Labels: class, outcome (success/blocked/retryable_failure/fatal_failure)
pub static EXECUTION_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_execution_outcomes_total",
        "Total terminal execution outcomes",
        &["class", "outcome"]
    )
    .unwrap()
});

/// Retries after a retryable gateway error.
pub static EXECUTION_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_execution_retries_total",
        "Total retries after retryable gateway errors",
        &["class", "kind"]
    )
    .unwrap()
});

/// Executions answered without sending (cache or find_order hit).
pub static EXECUTION_DEDUPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_execution_deduped_total",
        "Total executions answered from an earlier delivery",
        &["class", "source"]
    )
    .unwrap()
});

/// Executions currently in flight.
pub static EXECUTION_INFLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vigil_execution_inflight",
        "Current number of in-flight executions"
    )
    .unwrap()
});

// =============================================================================
// Position Monitor
// =============================================================================

/// Exit decisions by reason and action.
pub static EXIT_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_exit_decisions_total",
        "Total exit decisions produced",
        &["reason", "action"]
    )
    .unwrap()
});

/// Monitor cycles by result (completed/skipped).
pub static MONITOR_CYCLES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_monitor_cycles_total",
        "Total position monitor cycles",
        &["result"]
    )
    .unwrap()
});

/// Open positions seen in the last cycle.
pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vigil_open_positions",
        "Open positions seen in the last monitor cycle"
    )
    .unwrap()
});

/// Account margin ratio seen by portfolio protection.
pub static PORTFOLIO_MARGIN_RATIO: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "vigil_portfolio_margin_ratio",
        "Total margin used over account equity"
    )
    .unwrap()
});

/// Realized PnL of closed positions by exit reason.
pub static REALIZED_PNL: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "vigil_realized_pnl",
        "Cumulative realized PnL of closed positions",
        &["reason"]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    /// Publish a scope's current level and failure count.
    pub fn breaker_state(scope: &str, level: u8, failures: u32) {
        BREAKER_LEVEL
            .with_label_values(&[scope])
            .set(f64::from(level));
        BREAKER_FAILURES
            .with_label_values(&[scope])
            .set(f64::from(failures));
    }

    /// Record a level transition.
    pub fn breaker_transition(scope: &str, to: &str) {
        BREAKER_TRANSITIONS_TOTAL
            .with_label_values(&[scope, to])
            .inc();
    }

    /// Record a request denied by the blocked breaker.
    pub fn admission_denied(class: &str, priority: &str) {
        ADMISSION_DENIED_TOTAL
            .with_label_values(&[class, priority])
            .inc();
    }

    /// Record a request bypassing the blocked breaker.
    pub fn admission_bypass(class: &str, priority: &str) {
        ADMISSION_BYPASS_TOTAL
            .with_label_values(&[class, priority])
            .inc();
    }

    // -------------------------------------------------------------------------
    // Rate limiter
    // -------------------------------------------------------------------------

    pub fn limiter_tokens(tokens: f64) {
        LIMITER_TOKENS.set(tokens);
    }

    pub fn limiter_wait(wait_ms: f64) {
        LIMITER_WAIT_MS.observe(wait_ms);
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Record a terminal execution outcome.
    pub fn execution_outcome(class: &str, outcome: &str) {
        EXECUTION_OUTCOMES_TOTAL
            .with_label_values(&[class, outcome])
            .inc();
    }

    pub fn execution_retry(class: &str, kind: &str) {
        EXECUTION_RETRIES_TOTAL
            .with_label_values(&[class, kind])
            .inc();
    }

    /// Record an execution answered without re-sending.
    /// `source` is "cache" or "exchange".
    pub fn execution_deduped(class: &str, source: &str) {
        EXECUTION_DEDUPED_TOTAL
            .with_label_values(&[class, source])
            .inc();
    }

    pub fn inflight_inc() {
        EXECUTION_INFLIGHT.inc();
    }

    pub fn inflight_dec() {
        EXECUTION_INFLIGHT.dec();
    }

    // -------------------------------------------------------------------------
    // Position monitor
    // -------------------------------------------------------------------------

    pub fn exit_decision(reason: &str, action: &str) {
        EXIT_DECISIONS_TOTAL
            .with_label_values(&[reason, action])
            .inc();
    }

    pub fn monitor_cycle(result: &str) {
        MONITOR_CYCLES_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn open_positions(count: usize) {
        OPEN_POSITIONS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn portfolio_margin_ratio(ratio: f64) {
        PORTFOLIO_MARGIN_RATIO.set(ratio);
    }

    /// Add realized PnL of a closed position.
    pub fn realized_pnl(reason: &str, pnl: f64) {
        REALIZED_PNL.with_label_values(&[reason]).add(pnl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_state_sets_gauges() {
        Metrics::breaker_state("test_scope", 3, 5);
        assert_eq!(BREAKER_LEVEL.with_label_values(&["test_scope"]).get(), 3.0);
        assert_eq!(
            BREAKER_FAILURES.with_label_values(&["test_scope"]).get(),
            5.0
        );
    }

    #[test]
    fn test_counters_increment() {
        let before = ADMISSION_BYPASS_TOTAL
            .with_label_values(&["test_class", "critical"])
            .get();
        Metrics::admission_bypass("test_class", "critical");
        let after = ADMISSION_BYPASS_TOTAL
            .with_label_values(&["test_class", "critical"])
            .get();
        assert_eq!(after - before, 1.0);
    }
}
