//! Executor configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ExecutorError, ExecutorResult};

/// Retry and timeout settings for exchange calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Attempts per execute, first call included. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt (ms). Default: 500.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling (ms). Default: 5,000.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Timeout of a single exchange call (ms). Default: 10,000.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Completed idempotency keys remembered for cache answers. Default: 4,096.
    #[serde(default = "default_completed_cache_size")]
    pub completed_cache_size: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_completed_cache_size() -> usize {
    4_096
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            completed_cache_size: default_completed_cache_size(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.max_attempts == 0 {
            return Err(ExecutorError::ConfigError(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ExecutorError::ConfigError(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.call_timeout_ms == 0 {
            return Err(ExecutorError::ConfigError(
                "call_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
