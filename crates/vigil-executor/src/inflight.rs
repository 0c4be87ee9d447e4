//! In-flight execution tracking for graceful shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use vigil_telemetry::Metrics;

/// Thread-safe count of executions currently talking to the exchange.
///
/// Shutdown stops starting new work, then calls [`InflightTracker::drain`]
/// so an in-flight close is given a bounded chance to finish.
#[derive(Debug, Default)]
pub struct InflightTracker {
    count: AtomicU32,
    idle: Notify,
}

impl InflightTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Register one in-flight execution until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        Metrics::inflight_inc();
        InflightGuard {
            tracker: Arc::clone(self),
        }
    }

    fn leave(&self) {
        Metrics::inflight_dec();
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until nothing is in flight, for at most `grace`.
    ///
    /// Returns `true` if fully drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            if self.current() == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.current() == 0;
                }
            }
        }
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_counts() {
        let tracker = Arc::new(InflightTracker::new());
        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(tracker.current(), 2);
        drop(a);
        assert_eq!(tracker.current(), 1);
        drop(b);
        assert_eq!(tracker.current(), 0);
    }

    #[tokio::test]
    async fn test_drain_when_idle_is_immediate() {
        let tracker = Arc::new(InflightTracker::new());
        let mut drain = tokio_test::task::spawn(tracker.drain(Duration::from_secs(5)));
        assert!(tokio_test::assert_ready!(drain.poll()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_guard() {
        let tracker = Arc::new(InflightTracker::new());
        let guard = tracker.enter();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(guard);
        });

        assert!(tracker.drain(Duration::from_secs(5)).await);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace() {
        let tracker = Arc::new(InflightTracker::new());
        let _guard = tracker.enter();

        let start = Instant::now();
        assert!(!tracker.drain(Duration::from_secs(3)).await);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
