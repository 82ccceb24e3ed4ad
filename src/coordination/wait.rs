//! Shared wait behavior for every acquisition loop.
//!
//! All primitives retry through the same shape: attempt, then suspend on
//! the contended key until it changes or a jittered backoff delay elapses,
//! then attempt again - no unbounded busy-spin, no thundering herd.

use std::time::Duration;
use std::time::Instant;

use rand::Rng;

use super::error::AcquisitionTimeoutSnafu;
use super::error::CoordinationError;
use crate::store::AtomicStore;

/// How a primitive waits for a contended resource.
///
/// Backoff grows exponentially from `initial_interval` to `max_interval`
/// with up to `jitter` of extra randomized delay. `max_wait` bounds the
/// whole acquisition; `None` waits without bound. The wait suspends on the
/// store's change notification for the contended key, so a release can cut
/// a backoff short.
///
/// Waiting carries no fairness guarantee: whichever waiter retries first
/// after a release wins, regardless of how long the others have waited.
#[derive(Debug, Clone)]
pub struct WaitStrategy {
    /// First retry delay.
    pub initial_interval: Duration,
    /// Upper bound for the exponential backoff.
    pub max_interval: Duration,
    /// Maximum extra randomized delay added to each backoff.
    pub jitter: Duration,
    /// Total wait budget per acquisition. `None` is unbounded.
    pub max_wait: Option<Duration>,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
            max_wait: Some(Duration::from_secs(10)),
        }
    }
}

impl WaitStrategy {
    /// Jittered backoff delay for the given 0-based attempt.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_interval.saturating_mul(1u32 << attempt.min(16)).min(self.max_interval);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Wait budget left since `started`, if any. `Some(ZERO)` means spent.
    pub(crate) fn remaining(&self, started: Instant) -> Option<Duration> {
        self.max_wait.map(|max_wait| max_wait.saturating_sub(started.elapsed()))
    }

    /// Suspend until `key` changes or the backoff for `attempt` elapses.
    ///
    /// Fails with [`CoordinationError::AcquisitionTimeout`] once the wait
    /// budget measured from `started` is spent.
    pub(crate) async fn pause<S>(
        &self,
        store: &S,
        key: &str,
        resource: &str,
        started: Instant,
        attempt: u32,
    ) -> Result<(), CoordinationError>
    where
        S: AtomicStore + ?Sized,
    {
        let mut delay = self.delay(attempt);
        if let Some(remaining) = self.remaining(started) {
            if remaining.is_zero() {
                return AcquisitionTimeoutSnafu {
                    resource,
                    waited_ms: started.elapsed().as_millis() as u64,
                }
                .fail();
            }
            delay = delay.min(remaining);
        }
        store.wait_for_change(key, delay).await?;
        Ok(())
    }
}
