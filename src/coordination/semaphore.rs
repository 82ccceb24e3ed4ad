//! Distributed counting semaphore.
//!
//! A bounded counter of outstanding holders, adjusted atomically in both
//! directions: acquisition is rejected once `limit` holders are counted,
//! release is rejected below zero. The counter key expires after `ttl` of
//! inactivity, which is how permits of crashed holders come back.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use super::error::CapacityExceededSnafu;
use super::error::CoordinationError;
use super::wait::WaitStrategy;
use crate::constants::DEFAULT_NAMESPACE;
use crate::store::AdjustBounds;
use crate::store::AdjustOutcome;
use crate::store::AtomicStore;
use crate::store::keys;

/// Configuration for a semaphore.
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Key namespace.
    pub namespace: String,
    /// Maximum concurrent holders.
    pub limit: u32,
    /// Inactivity TTL for the holder counter, refreshed on every acquire
    /// and release.
    ///
    /// Holds are expected to finish within this window: the counter cannot
    /// attribute entries to holders, so a permit held past the TTL may
    /// already have been reclaimed when it is released.
    pub ttl: Duration,
    /// Retry behavior while no permit is available.
    pub wait: WaitStrategy,
}

impl SemaphoreConfig {
    /// Config with the given holder limit and defaults elsewhere.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            limit,
            ttl: Duration::from_secs(60),
            wait: WaitStrategy::default(),
        }
    }
}

/// A distributed counting semaphore.
///
/// Allows up to `limit` concurrent holders across all processes. The count
/// of live holders never exceeds the limit: both directions of the counter
/// move through one atomic bounded adjustment.
pub struct Semaphore<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    config: SemaphoreConfig,
}

impl<S: AtomicStore + ?Sized + 'static> Semaphore<S> {
    /// Create a semaphore handle for `name`.
    pub fn new(store: Arc<S>, name: &str, config: SemaphoreConfig) -> Self {
        let key = keys::semaphore_key(&config.namespace, name);
        Self { store, key, config }
    }

    /// Whether a permit could be acquired right now, without mutating.
    ///
    /// Purely advisory: another process may take the last permit between
    /// this check and an acquisition attempt.
    pub async fn can_acquire(&self) -> Result<bool, CoordinationError> {
        Ok(self.store.read_counter(&self.key).await? < self.config.limit as i64)
    }

    /// Permits not currently held.
    pub async fn available(&self) -> Result<u32, CoordinationError> {
        let held = self.store.read_counter(&self.key).await?.clamp(0, self.config.limit as i64);
        Ok(self.config.limit - held as u32)
    }

    /// Acquire a permit, waiting through the configured strategy.
    ///
    /// Fails with [`CoordinationError::AcquisitionTimeout`] once the wait
    /// budget is spent.
    pub async fn acquire(&self) -> Result<SemaphorePermit<S>, CoordinationError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if let Some(permit) = self.try_acquire().await? {
                return Ok(permit);
            }
            debug!(key = %self.key, attempt, "semaphore full, backing off");
            let resource = format!("semaphore '{}'", self.key);
            self.config.wait.pause(&self.store, &self.key, &resource, started, attempt).await?;
            attempt += 1;
        }
    }

    /// Try to acquire a permit without waiting.
    pub async fn try_acquire(&self) -> Result<Option<SemaphorePermit<S>>, CoordinationError> {
        match self.store.atomic_adjust(&self.key, 1, self.bounds()).await? {
            AdjustOutcome::Applied(held) => {
                debug!(key = %self.key, held, limit = self.config.limit, "permit acquired");
                Ok(Some(SemaphorePermit {
                    store: Arc::clone(&self.store),
                    key: self.key.clone(),
                    bounds: self.bounds(),
                    released: false,
                }))
            }
            AdjustOutcome::Rejected { .. } => Ok(None),
        }
    }

    fn bounds(&self) -> AdjustBounds {
        AdjustBounds::new(0, self.config.limit as i64).with_ttl(self.config.ttl)
    }
}

/// A held semaphore permit.
///
/// Dropping the permit performs a best-effort release on a spawned task;
/// call [`release`](SemaphorePermit::release) to observe the result.
pub struct SemaphorePermit<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    bounds: AdjustBounds,
    released: bool,
}

impl<S: AtomicStore + ?Sized + 'static> std::fmt::Debug for SemaphorePermit<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("key", &self.key)
            .field("bounds", &self.bounds)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S: AtomicStore + ?Sized + 'static> SemaphorePermit<S> {
    /// Return the permit.
    ///
    /// Fails with [`CoordinationError::CapacityExceeded`] if the release
    /// would take the holder count below zero - a store-level
    /// inconsistency that is reported, not retried.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        match self.store.atomic_adjust(&self.key, -1, self.bounds).await? {
            AdjustOutcome::Applied(held) => {
                debug!(key = %self.key, held, "permit released");
                Ok(())
            }
            AdjustOutcome::Rejected { current } => CapacityExceededSnafu {
                key: self.key.as_str(),
                observed: current,
                min: self.bounds.min,
                max: self.bounds.max,
            }
            .fail(),
        }
    }
}

impl<S: AtomicStore + ?Sized + 'static> Drop for SemaphorePermit<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let bounds = self.bounds;
        tokio::spawn(async move {
            if let Err(e) = store.atomic_adjust(&key, -1, bounds).await {
                debug!(key = %key, error = %e, "permit release on drop failed (counter will expire via TTL)");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeterministicStore;

    fn quick_config(limit: u32) -> SemaphoreConfig {
        SemaphoreConfig {
            wait: WaitStrategy {
                initial_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
                jitter: Duration::from_millis(5),
                max_wait: Some(Duration::from_millis(200)),
            },
            ..SemaphoreConfig::with_limit(limit)
        }
    }

    #[tokio::test]
    async fn limit_is_enforced() {
        let store = DeterministicStore::new();
        let semaphore = Semaphore::new(store, "pool", quick_config(2));

        let first = semaphore.try_acquire().await.unwrap().unwrap();
        let _second = semaphore.try_acquire().await.unwrap().unwrap();

        assert!(semaphore.try_acquire().await.unwrap().is_none());
        assert!(!semaphore.can_acquire().await.unwrap());
        assert_eq!(semaphore.available().await.unwrap(), 0);

        first.release().await.unwrap();
        assert!(semaphore.can_acquire().await.unwrap());
        assert!(semaphore.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_a_release() {
        let store = DeterministicStore::new();
        let semaphore = Arc::new(Semaphore::new(store, "pool", quick_config(1)));

        let permit = semaphore.try_acquire().await.unwrap().unwrap();

        let contender = Arc::clone(&semaphore);
        let pending = tokio::spawn(async move {
            let permit = contender.acquire().await?;
            permit.release().await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        permit.release().await.unwrap();

        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn acquire_times_out_when_full() {
        let store = DeterministicStore::new();
        let semaphore = Semaphore::new(store, "pool", quick_config(1));

        let _permit = semaphore.try_acquire().await.unwrap().unwrap();
        let err = semaphore.acquire().await.unwrap_err();
        assert!(matches!(err, CoordinationError::AcquisitionTimeout { .. }));
    }

    #[tokio::test]
    async fn drop_returns_the_permit() {
        let store = DeterministicStore::new();
        let semaphore = Semaphore::new(store, "pool", quick_config(1));

        {
            let _permit = semaphore.try_acquire().await.unwrap().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(semaphore.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn crashed_holder_lapses_via_ttl() {
        let store = DeterministicStore::new();
        let mut config = quick_config(1);
        config.ttl = Duration::from_millis(40);
        let semaphore = Semaphore::new(store, "pool", config);

        let permit = semaphore.try_acquire().await.unwrap().unwrap();
        std::mem::forget(permit);

        assert!(semaphore.try_acquire().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(semaphore.try_acquire().await.unwrap().is_some());
    }
}
