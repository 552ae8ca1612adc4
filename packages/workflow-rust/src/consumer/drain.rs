//! In-flight dispatch tracking for graceful stop.
//!
//! An atomic counter with RAII guards counts dispatches that have started but
//! not yet settled their message, so `stop` can wait for them to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts in-flight message dispatches.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    in_flight: Arc<AtomicU64>,
}

impl InFlightTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an RAII guard that tracks one in-flight dispatch.
    ///
    /// The counter is incremented on creation and decremented when the guard
    /// is dropped, even if the dispatch panics.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Returns the current number of in-flight dispatches.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for all in-flight dispatches to complete, up to the given timeout.
    ///
    /// Returns `true` if everything drained, `false` if the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
