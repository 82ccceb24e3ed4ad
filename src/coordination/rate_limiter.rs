//! Distributed token-bucket rate limiter.
//!
//! The bucket holds up to `rate` tokens and replenishes continuously at
//! `rate / period`. Refill and admission happen inside the store adapter's
//! single scripted step, so admission is exact across any number of
//! processes and never depends on their clocks.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use super::error::CoordinationError;
use super::error::RateLimitExceededSnafu;
use super::wait::WaitStrategy;
use crate::constants::DEFAULT_NAMESPACE;
use crate::store::AtomicStore;
use crate::store::RefillPolicy;
use crate::store::TakeOutcome;
use crate::store::keys;

/// Configuration for a rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Key namespace.
    pub namespace: String,
    /// Admissions allowed per `period`; also the burst capacity.
    pub rate: u32,
    /// Window over which `rate` admissions replenish.
    pub period: Duration,
    /// Wait budget for [`RateLimiter::acquire_or_wait`].
    pub wait: WaitStrategy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            rate: 10,
            period: Duration::from_secs(60),
            wait: WaitStrategy::default(),
        }
    }
}

/// A distributed token-bucket rate limiter.
pub struct RateLimiter<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    config: RateLimiterConfig,
}

impl<S: AtomicStore + ?Sized + 'static> RateLimiter<S> {
    /// Create a rate limiter handle for `name`.
    pub fn new(store: Arc<S>, name: &str, config: RateLimiterConfig) -> Self {
        let key = keys::limiter_key(&config.namespace, name);
        Self { store, key, config }
    }

    /// Attempt one admission. Fail-closed: a single atomic attempt, no
    /// waiting, `Ok(false)` when the bucket is empty.
    pub async fn acquire(&self) -> Result<bool, CoordinationError> {
        match self.take().await? {
            TakeOutcome::Admitted { remaining } => {
                debug!(key = %self.key, remaining, "admission granted");
                Ok(true)
            }
            TakeOutcome::Throttled { .. } => Ok(false),
        }
    }

    /// Acquire an admission, retrying with backoff until admitted or the
    /// wait budget is spent, then fail with
    /// [`CoordinationError::RateLimitExceeded`].
    pub async fn acquire_or_wait(&self) -> Result<(), CoordinationError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let retry_after = match self.take().await? {
                TakeOutcome::Admitted { remaining } => {
                    debug!(key = %self.key, remaining, waited_ms = started.elapsed().as_millis() as u64, "admission granted");
                    return Ok(());
                }
                TakeOutcome::Throttled { retry_after } => retry_after,
            };

            // The bucket refills with time, not with other processes'
            // writes, so plain sleep - bounded by the replenishment hint -
            // replaces waiting on a key change.
            let mut delay = retry_after.min(self.config.wait.delay(attempt));
            if let Some(remaining) = self.config.wait.remaining(started) {
                if remaining.is_zero() {
                    return RateLimitExceededSnafu {
                        key: self.key.as_str(),
                        retry_after_ms: retry_after.as_millis() as u64,
                    }
                    .fail();
                }
                delay = delay.min(remaining);
            }
            debug!(key = %self.key, attempt, delay_ms = delay.as_millis() as u64, "throttled, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// The scripted refill-and-take step.
    async fn take(&self) -> Result<TakeOutcome, CoordinationError> {
        let refill = RefillPolicy { rate: self.config.rate, period: self.config.period };
        Ok(self.store.bucket_take(&self.key, &refill).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeterministicStore;

    #[tokio::test]
    async fn burst_up_to_rate_then_rejected() {
        let store = DeterministicStore::new();
        let limiter = RateLimiter::new(store, "api", RateLimiterConfig {
            rate: 10,
            period: Duration::from_secs(60),
            ..RateLimiterConfig::default()
        });

        for i in 0..10 {
            assert!(limiter.acquire().await.unwrap(), "admission {i} should succeed");
        }
        // The 11th within the period is rejected, and rejection does not
        // consume anything.
        assert!(!limiter.acquire().await.unwrap());
        assert!(!limiter.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn replenishes_after_a_full_period() {
        let store = DeterministicStore::new();
        let limiter = RateLimiter::new(store, "api", RateLimiterConfig {
            rate: 10,
            period: Duration::from_millis(200),
            ..RateLimiterConfig::default()
        });

        for _ in 0..10 {
            assert!(limiter.acquire().await.unwrap());
        }
        assert!(!limiter.acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        for i in 0..10 {
            assert!(limiter.acquire().await.unwrap(), "admission {i} after refill should succeed");
        }
        assert!(!limiter.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn acquire_or_wait_rides_out_a_short_deficit() {
        let store = DeterministicStore::new();
        let limiter = RateLimiter::new(store, "api", RateLimiterConfig {
            rate: 5,
            period: Duration::from_millis(100),
            wait: WaitStrategy {
                max_wait: Some(Duration::from_secs(2)),
                ..WaitStrategy::default()
            },
            ..RateLimiterConfig::default()
        });

        for _ in 0..5 {
            assert!(limiter.acquire().await.unwrap());
        }
        // One token replenishes every 20ms; this should wait, not fail.
        limiter.acquire_or_wait().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_or_wait_fails_once_budget_spent() {
        let store = DeterministicStore::new();
        let limiter = RateLimiter::new(store, "api", RateLimiterConfig {
            rate: 1,
            period: Duration::from_secs(60),
            wait: WaitStrategy {
                max_wait: Some(Duration::from_millis(50)),
                ..WaitStrategy::default()
            },
            ..RateLimiterConfig::default()
        });

        assert!(limiter.acquire().await.unwrap());
        let err = limiter.acquire_or_wait().await.unwrap_err();
        assert!(matches!(err, CoordinationError::RateLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn limiters_with_different_names_are_independent() {
        let store = DeterministicStore::new();
        let config = RateLimiterConfig { rate: 1, ..RateLimiterConfig::default() };
        let first = RateLimiter::new(Arc::clone(&store), "a", config.clone());
        let second = RateLimiter::new(store, "b", config);

        assert!(first.acquire().await.unwrap());
        assert!(second.acquire().await.unwrap());
        assert!(!first.acquire().await.unwrap());
    }
}
