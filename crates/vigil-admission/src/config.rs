//! Admission control configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use vigil_core::OperationClass;

use crate::error::{AdmissionError, AdmissionResult};

/// Graded circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure count at which the level becomes WARNING. Default: 3.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    /// Failure count at which the level becomes THROTTLED. Default: 5.
    #[serde(default = "default_throttled_threshold")]
    pub throttled_threshold: u32,
    /// Failure count at which the level becomes BLOCKED. Default: 8.
    #[serde(default = "default_blocked_threshold")]
    pub blocked_threshold: u32,
    /// Seconds without a new failure after which a scope fully resets. Default: 300.
    #[serde(default = "default_breaker_timeout_secs")]
    pub breaker_timeout_secs: u64,
    /// Delay a THROTTLED caller must wait before sending (ms). Default: 2000.
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    /// Operation classes admitted even while BLOCKED. Default: [close_position].
    #[serde(default = "default_bypass_whitelist")]
    pub bypass_whitelist: Vec<OperationClass>,
    /// Decrement the failure count by one on each success. Default: true.
    #[serde(default = "default_true")]
    pub decay_on_success: bool,
    /// Track one state per operation class instead of a single global state.
    /// Default: true.
    #[serde(default = "default_true")]
    pub per_class: bool,
    /// Maximum audit events retained in memory. Default: 256.
    #[serde(default = "default_journal_capacity")]
    pub journal_capacity: usize,
}

fn default_warning_threshold() -> u32 {
    3
}

fn default_throttled_threshold() -> u32 {
    5
}

fn default_blocked_threshold() -> u32 {
    8
}

fn default_breaker_timeout_secs() -> u64 {
    300
}

fn default_throttle_delay_ms() -> u64 {
    2_000
}

fn default_bypass_whitelist() -> Vec<OperationClass> {
    vec![OperationClass::ClosePosition]
}

fn default_true() -> bool {
    true
}

fn default_journal_capacity() -> usize {
    256
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            throttled_threshold: default_throttled_threshold(),
            blocked_threshold: default_blocked_threshold(),
            breaker_timeout_secs: default_breaker_timeout_secs(),
            throttle_delay_ms: default_throttle_delay_ms(),
            bypass_whitelist: default_bypass_whitelist(),
            decay_on_success: default_true(),
            per_class: default_true(),
            journal_capacity: default_journal_capacity(),
        }
    }
}

impl BreakerConfig {
    /// Config with the given thresholds and defaults elsewhere.
    #[must_use]
    pub fn with_thresholds(warning: u32, throttled: u32, blocked: u32) -> Self {
        Self {
            warning_threshold: warning,
            throttled_threshold: throttled,
            blocked_threshold: blocked,
            ..Self::default()
        }
    }

    /// Check `0 < warning < throttled < blocked` and a non-zero timeout.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.warning_threshold == 0
            || self.warning_threshold >= self.throttled_threshold
            || self.throttled_threshold >= self.blocked_threshold
        {
            return Err(AdmissionError::ThresholdOrder {
                warning: self.warning_threshold,
                throttled: self.throttled_threshold,
                blocked: self.blocked_threshold,
            });
        }
        if self.breaker_timeout_secs == 0 {
            return Err(AdmissionError::ConfigError(
                "breaker_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_timeout_secs)
    }

    #[must_use]
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum burst size. Default: 10.
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: u32,
    /// Tokens added per second. Default: 5.0.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

fn default_bucket_capacity() -> u32 {
    10
}

fn default_refill_rate() -> f64 {
    5.0
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: default_bucket_capacity(),
            refill_rate: default_refill_rate(),
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.bucket_capacity == 0 {
            return Err(AdmissionError::ConfigError(
                "bucket_capacity must be > 0".to_string(),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(AdmissionError::ConfigError(format!(
                "refill_rate must be a positive number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}
