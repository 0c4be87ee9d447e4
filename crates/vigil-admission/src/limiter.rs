//! Token bucket rate limiting for outbound exchange calls.
//!
//! Refill is continuous and computed lazily from elapsed time on every
//! acquire; there is no background refill task. Waiters queue through a
//! fair async mutex so a caller waits at most behind the callers that
//! arrived before it.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use vigil_telemetry::Metrics;

use crate::config::LimiterConfig;
use crate::error::AdmissionResult;

/// Floor on a single refill sleep, matching the timer resolution.
const MIN_REFILL_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Add tokens for the time elapsed since the last refill, capped at capacity.
    fn refill(&mut self, now: Instant, capacity: f64, refill_rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * refill_rate).min(capacity);
        self.last_refill = now;
    }
}

/// Process-wide token bucket shared by every outbound caller.
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
    /// FIFO queue for suspended acquirers.
    turnstile: tokio::sync::Mutex<()>,
}

impl TokenBucketLimiter {
    /// Create a full bucket.
    ///
    /// # Arguments
    /// * `capacity` - Maximum burst size, must be > 0
    /// * `refill_rate` - Tokens added per second, must be finite and > 0
    pub fn new(capacity: u32, refill_rate: f64) -> AdmissionResult<Self> {
        Self::from_config(&LimiterConfig {
            bucket_capacity: capacity,
            refill_rate,
        })
    }

    /// Create from validated configuration.
    pub fn from_config(config: &LimiterConfig) -> AdmissionResult<Self> {
        config.validate()?;
        let capacity = f64::from(config.bucket_capacity);
        Ok(Self {
            capacity,
            refill_rate: config.refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            turnstile: tokio::sync::Mutex::new(()),
        })
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        let started = Instant::now();
        let _turn = self.turnstile.lock().await;

        loop {
            let wait = match self.take_or_deficit() {
                None => break,
                Some(deficit) => {
                    Duration::from_secs_f64(deficit / self.refill_rate).max(MIN_REFILL_SLEEP)
                }
            };
            trace!(wait_ms = wait.as_millis() as u64, "Waiting for rate limiter token");
            tokio::time::sleep(wait).await;
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            debug!(waited_ms = waited.as_millis() as u64, "Rate limiter token acquired after wait");
        }
        Metrics::limiter_wait(waited.as_secs_f64() * 1000.0);
    }

    /// Take a token if one is available right now.
    ///
    /// Returns `false` without taking a token when queued `acquire` callers
    /// are ahead.
    pub fn try_acquire(&self) -> bool {
        let Ok(_turn) = self.turnstile.try_lock() else {
            return false;
        };
        self.take_or_deficit().is_none()
    }

    /// Tokens currently available (after refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.capacity, self.refill_rate);
        bucket.tokens
    }

    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Take one token, or report how many tokens are still missing.
    fn take_or_deficit(&self) -> Option<f64> {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.capacity, self.refill_rate);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Metrics::limiter_tokens(bucket.tokens);
            None
        } else {
            Some(1.0 - bucket.tokens)
        }
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.bucket.lock().tokens)
            .finish()
    }
}
