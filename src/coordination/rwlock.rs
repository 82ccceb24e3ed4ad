//! Distributed reader/writer lock.
//!
//! Coordinates shared read access and exclusive write access under one
//! resource name using three store keys:
//!
//! - `…:readers` - bounded counter of current readers
//! - `…:writer`  - the writer's lease
//! - `…:intent`  - counter of writers waiting or holding (the write-intent
//!   flag)
//!
//! Write-intent exists to stop a flood of readers from starving a waiting
//! writer: new readers refuse to join while any intent is registered.
//! Intent is raised before the writer lease is acquired and withdrawn only
//! after it is released, so `intent == 0` also certifies that no writer
//! lease is held - a reader's admission check is a single-key decision.
//!
//! Cross-key overlap windows are closed by verify-after-commit: a reader
//! increments the counter, re-checks intent, and backs out with a
//! compensating decrement if a writer registered in the window; a writer
//! that claims the lease waits out any reader that was admitted before its
//! intent registered. Read mode held and write mode held are therefore
//! mutually exclusive, while every store mutation stays one atomic op.
//!
//! Each instance mirrors which mode it currently holds, purely to reject
//! misuse (double acquire, release without holding). The mirror is not
//! synchronized and must not be shared between concurrent callers: use one
//! instance per concurrent caller. Distributed state lives only in the
//! store.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::error::CapacityExceededSnafu;
use super::error::CoordinationError;
use super::error::MisuseSnafu;
use super::error::NotOwnerSnafu;
use super::lease::Lease;
use super::lease::LeaseRollback;
use super::wait::WaitStrategy;
use crate::constants::DEFAULT_NAMESPACE;
use crate::constants::MAX_PENDING_WRITERS;
use crate::constants::MAX_RWLOCK_READERS;
use crate::store::AdjustBounds;
use crate::store::AdjustOutcome;
use crate::store::AtomicStore;
use crate::store::keys;

/// Acquisition mode, chosen explicitly on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    /// Shared access; any number of concurrent readers.
    Read,
    /// Exclusive access; excludes readers and other writers.
    Write,
}

/// Configuration for a reader/writer lock.
#[derive(Debug, Clone)]
pub struct RwLockConfig {
    /// Key namespace.
    pub namespace: String,
    /// TTL for the writer lease and for the reader/intent counters. A
    /// crashed holder's contribution lapses with it.
    ///
    /// Holds and acquisition waits are expected to finish within this
    /// window: the counters cannot attribute entries to holders, so a
    /// contribution that outlives the TTL is reported as `NotOwner` where
    /// detectable rather than reconciled. Keep `wait.max_wait` under it.
    pub ttl: std::time::Duration,
    /// Retry behavior while the lock is contended.
    pub wait: WaitStrategy,
}

impl Default for RwLockConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: std::time::Duration::from_secs(30),
            wait: WaitStrategy::default(),
        }
    }
}

enum Held {
    None,
    Read,
    Write(Lease),
}

/// A distributed reader/writer lock handle.
///
/// One instance serves one concurrent caller; create another instance
/// (over the same name) for each additional task contending on the lock.
pub struct RwLock<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    name: String,
    readers_key: String,
    writer_key: String,
    intent_key: String,
    config: RwLockConfig,
    held: Held,
}

impl<S: AtomicStore + ?Sized + 'static> RwLock<S> {
    /// Create a lock handle for `name`.
    pub fn new(store: Arc<S>, name: &str, config: RwLockConfig) -> Self {
        Self {
            readers_key: keys::rwlock_readers_key(&config.namespace, name),
            writer_key: keys::rwlock_writer_key(&config.namespace, name),
            intent_key: keys::rwlock_intent_key(&config.namespace, name),
            name: name.to_string(),
            store,
            config,
            held: Held::None,
        }
    }

    /// Acquire the lock in the given mode, waiting through the configured
    /// strategy.
    ///
    /// Fails with [`CoordinationError::AcquisitionTimeout`] once the wait
    /// budget is spent, and with [`CoordinationError::Misuse`] when this
    /// instance already holds a mode.
    pub async fn acquire(&mut self, mode: RwMode) -> Result<RwLockGuard<'_, S>, CoordinationError> {
        if !matches!(self.held, Held::None) {
            return MisuseSnafu {
                reason: format!("rwlock instance for '{}' already holds a mode; one instance serves one caller", self.name),
            }
            .fail();
        }
        match mode {
            RwMode::Read => {
                self.acquire_read().await?;
                self.held = Held::Read;
            }
            RwMode::Write => {
                let lease = self.acquire_write().await?;
                self.held = Held::Write(lease);
            }
        }
        debug!(name = %self.name, ?mode, "rwlock acquired");
        Ok(RwLockGuard { lock: self, released: false })
    }

    /// The mode currently held by this instance, if any.
    pub fn held_mode(&self) -> Option<RwMode> {
        match self.held {
            Held::None => None,
            Held::Read => Some(RwMode::Read),
            Held::Write(_) => Some(RwMode::Write),
        }
    }

    fn reader_bounds(&self) -> AdjustBounds {
        AdjustBounds::new(0, MAX_RWLOCK_READERS).with_ttl(self.config.ttl)
    }

    fn intent_bounds(&self) -> AdjustBounds {
        AdjustBounds::new(0, MAX_PENDING_WRITERS).with_ttl(self.config.ttl)
    }

    async fn acquire_read(&self) -> Result<(), CoordinationError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let resource = format!("read lock '{}'", self.name);

        loop {
            // Writers waiting or holding; back off rather than starve them.
            if self.store.read_counter(&self.intent_key).await? > 0 {
                self.config.wait.pause(&self.store, &self.intent_key, &resource, started, attempt).await?;
                attempt += 1;
                continue;
            }

            match self.store.atomic_adjust(&self.readers_key, 1, self.reader_bounds()).await? {
                AdjustOutcome::Applied(_) => {}
                AdjustOutcome::Rejected { current } => {
                    return CapacityExceededSnafu {
                        key: self.readers_key.as_str(),
                        observed: current,
                        min: 0i64,
                        max: MAX_RWLOCK_READERS,
                    }
                    .fail();
                }
            }

            // We are counted. Re-check intent: a writer may have registered
            // between the check above and the increment. The rollback covers
            // cancellation while the re-check is in flight.
            let mut rollback =
                CounterRollback::armed(Arc::clone(&self.store), self.readers_key.clone(), self.reader_bounds());
            match self.store.read_counter(&self.intent_key).await {
                Ok(0) => {
                    rollback.disarm();
                    return Ok(());
                }
                Ok(_) => {
                    // A writer slipped in; back out and let it through.
                    rollback.disarm();
                    if let AdjustOutcome::Rejected { current } =
                        self.store.atomic_adjust(&self.readers_key, -1, self.reader_bounds()).await?
                    {
                        return CapacityExceededSnafu {
                            key: self.readers_key.as_str(),
                            observed: current,
                            min: 0i64,
                            max: MAX_RWLOCK_READERS,
                        }
                        .fail();
                    }
                    self.config.wait.pause(&self.store, &self.intent_key, &resource, started, attempt).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn acquire_write(&self) -> Result<Lease, CoordinationError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let resource = format!("write lock '{}'", self.name);

        // Register intent first: new readers stop joining while we wait.
        match self.store.atomic_adjust(&self.intent_key, 1, self.intent_bounds()).await? {
            AdjustOutcome::Applied(_) => {}
            AdjustOutcome::Rejected { current } => {
                return CapacityExceededSnafu {
                    key: self.intent_key.as_str(),
                    observed: current,
                    min: 0i64,
                    max: MAX_PENDING_WRITERS,
                }
                .fail();
            }
        }
        // Withdrawn on every failure path; on success intent stays
        // registered until release.
        let mut intent_rollback =
            CounterRollback::armed(Arc::clone(&self.store), self.intent_key.clone(), self.intent_bounds());

        // Wait for readers to drain, then claim the writer lease.
        let lease = loop {
            if self.store.read_counter(&self.readers_key).await? > 0 {
                self.config.wait.pause(&self.store, &self.readers_key, &resource, started, attempt).await?;
                attempt += 1;
                continue;
            }
            match Lease::acquire(&self.store, &self.writer_key, self.config.ttl).await? {
                Some(lease) => break lease,
                None => {
                    self.config.wait.pause(&self.store, &self.writer_key, &resource, started, attempt).await?;
                    attempt += 1;
                }
            }
        };

        // A reader admitted before our intent registered may still be
        // counted; it will drain, and no new reader can join past the
        // intent. Hold the lease while waiting it out.
        let mut lease_rollback = LeaseRollback::armed(Arc::clone(&self.store), lease.clone());
        while self.store.read_counter(&self.readers_key).await? > 0 {
            self.config.wait.pause(&self.store, &self.readers_key, &resource, started, attempt).await?;
            attempt += 1;
        }
        lease_rollback.disarm();
        intent_rollback.disarm();
        Ok(lease)
    }

    async fn release_held(&mut self) -> Result<(), CoordinationError> {
        match std::mem::replace(&mut self.held, Held::None) {
            Held::None => MisuseSnafu {
                reason: format!("rwlock instance for '{}' released without holding a mode", self.name),
            }
            .fail(),
            Held::Read => match self.store.atomic_adjust(&self.readers_key, -1, self.reader_bounds()).await? {
                AdjustOutcome::Applied(_) => {
                    debug!(name = %self.name, "read lock released");
                    Ok(())
                }
                // Our counted entry lapsed with the counter TTL; the hold
                // outran its lease.
                AdjustOutcome::Rejected { .. } => NotOwnerSnafu { key: self.readers_key.as_str() }.fail(),
            },
            Held::Write(lease) => {
                // Lease first, intent second: readers stay blocked until
                // the release is complete, so intent == 0 still implies no
                // writer lease.
                let owned = lease.release(&*self.store).await?;
                if owned {
                    if let AdjustOutcome::Rejected { .. } =
                        self.store.atomic_adjust(&self.intent_key, -1, self.intent_bounds()).await?
                    {
                        debug!(name = %self.name, "write intent already lapsed at release");
                    }
                    debug!(name = %self.name, "write lock released");
                    Ok(())
                } else {
                    // Our hold lapsed via TTL, and so did our intent
                    // contribution. Decrementing now would withdraw a
                    // successor writer's intent instead; leave the counter
                    // to the TTL.
                    NotOwnerSnafu { key: self.writer_key.as_str() }.fail()
                }
            }
        }
    }

    /// Best-effort release for the guard's drop path.
    fn spawn_release_held(&mut self) {
        let held = std::mem::replace(&mut self.held, Held::None);
        let store = Arc::clone(&self.store);
        match held {
            Held::None => {}
            Held::Read => {
                let key = self.readers_key.clone();
                let bounds = self.reader_bounds();
                tokio::spawn(async move {
                    if let Err(e) = store.atomic_adjust(&key, -1, bounds).await {
                        debug!(key = %key, error = %e, "read release on drop failed (counter will expire via TTL)");
                    }
                });
            }
            Held::Write(lease) => {
                let intent_key = self.intent_key.clone();
                let bounds = self.intent_bounds();
                tokio::spawn(async move {
                    // Withdraw intent only if the lease was still ours; a
                    // stale decrement would hit a successor's registration.
                    match lease.release(&*store).await {
                        Ok(true) => {
                            if let Err(e) = store.atomic_adjust(&intent_key, -1, bounds).await {
                                debug!(key = %intent_key, error = %e, "intent withdrawal on drop failed (counter will expire via TTL)");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!(key = %lease.key(), error = %e, "write release on drop failed (lease will expire via TTL)");
                        }
                    }
                });
            }
        }
    }
}

/// Guard for a held read or write mode.
///
/// Dropping the guard performs a best-effort release on a spawned task;
/// call [`release`](RwLockGuard::release) to learn whether the hold was
/// still valid at the end.
pub struct RwLockGuard<'a, S: AtomicStore + ?Sized + 'static> {
    lock: &'a mut RwLock<S>,
    released: bool,
}

impl<'a, S: AtomicStore + ?Sized + 'static> std::fmt::Debug for RwLockGuard<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockGuard")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S: AtomicStore + ?Sized + 'static> RwLockGuard<'_, S> {
    /// The mode this guard holds.
    pub fn mode(&self) -> RwMode {
        match self.lock.held {
            Held::Read => RwMode::Read,
            Held::Write(_) => RwMode::Write,
            Held::None => unreachable!("guard exists only while a mode is held"),
        }
    }

    /// Release the held mode.
    ///
    /// Fails with [`CoordinationError::NotOwner`] when the hold had
    /// already lapsed via TTL - the protected section outran its lease.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        self.lock.release_held().await
    }
}

impl<S: AtomicStore + ?Sized + 'static> Drop for RwLockGuard<'_, S> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.spawn_release_held();
        }
    }
}

/// Spawns a compensating decrement when dropped while armed.
struct CounterRollback<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    bounds: AdjustBounds,
    armed: bool,
}

impl<S: AtomicStore + ?Sized + 'static> CounterRollback<S> {
    fn armed(store: Arc<S>, key: String, bounds: AdjustBounds) -> Self {
        Self { store, key, bounds, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: AtomicStore + ?Sized + 'static> Drop for CounterRollback<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let bounds = self.bounds;
        tokio::spawn(async move {
            match store.atomic_adjust(&key, -1, bounds).await {
                Ok(_) => debug!(key = %key, "compensating decrement after cancellation"),
                Err(e) => {
                    debug!(key = %key, error = %e, "compensating decrement failed (counter will expire via TTL)")
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::DeterministicStore;

    fn quick_config(max_wait_ms: u64) -> RwLockConfig {
        RwLockConfig {
            ttl: Duration::from_secs(5),
            wait: WaitStrategy {
                initial_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
                jitter: Duration::from_millis(5),
                max_wait: Some(Duration::from_millis(max_wait_ms)),
            },
            ..RwLockConfig::default()
        }
    }

    #[tokio::test]
    async fn readers_share_the_lock() {
        let store = DeterministicStore::new();
        let mut first = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));
        let mut second = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));

        let guard_a = first.acquire(RwMode::Read).await.unwrap();
        let guard_b = second.acquire(RwMode::Read).await.unwrap();
        assert_eq!(guard_a.mode(), RwMode::Read);

        guard_a.release().await.unwrap();
        guard_b.release().await.unwrap();
    }

    #[tokio::test]
    async fn write_mode_excludes_readers() {
        let store = DeterministicStore::new();
        let mut writer = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));
        let mut reader = RwLock::new(Arc::clone(&store), "cfg", quick_config(80));

        let guard = writer.acquire(RwMode::Write).await.unwrap();

        let err = reader.acquire(RwMode::Read).await.unwrap_err();
        assert!(matches!(err, CoordinationError::AcquisitionTimeout { .. }));

        guard.release().await.unwrap();
        let guard = reader.acquire(RwMode::Read).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn readers_block_writers_until_released() {
        let store = DeterministicStore::new();
        let mut reader = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));
        let mut writer = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));

        let read_guard = reader.acquire(RwMode::Read).await.unwrap();

        let pending = tokio::spawn(async move {
            let guard = writer.acquire(RwMode::Write).await?;
            guard.release().await?;
            Ok::<_, CoordinationError>(writer)
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        read_guard.release().await.unwrap();

        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pending_writer_blocks_new_readers() {
        let store = DeterministicStore::new();
        let mut early_reader = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));
        let mut writer = RwLock::new(Arc::clone(&store), "cfg", quick_config(2000));
        let mut late_reader = RwLock::new(Arc::clone(&store), "cfg", quick_config(80));

        let read_guard = early_reader.acquire(RwMode::Read).await.unwrap();

        // Writer registers intent and waits for the reader to drain.
        let pending = tokio::spawn(async move {
            let guard = writer.acquire(RwMode::Write).await?;
            // Hold briefly so the late reader observes the write hold too.
            tokio::time::sleep(Duration::from_millis(50)).await;
            guard.release().await?;
            Ok::<_, CoordinationError>(())
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A new reader must not join past the registered intent.
        let err = late_reader.acquire(RwMode::Read).await.unwrap_err();
        assert!(matches!(err, CoordinationError::AcquisitionTimeout { .. }));

        read_guard.release().await.unwrap();
        pending.await.unwrap().unwrap();

        // With the writer gone, readers join freely again.
        let guard = late_reader.acquire(RwMode::Read).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn stale_write_release_reports_not_owner() {
        let store = DeterministicStore::new();
        let mut config = quick_config(2000);
        config.ttl = Duration::from_millis(40);
        let mut writer = RwLock::new(Arc::clone(&store), "cfg", config.clone());
        let mut successor = RwLock::new(Arc::clone(&store), "cfg", config);

        let stale = writer.acquire(RwMode::Write).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Everything lapsed; a new writer takes over.
        let fresh = successor.acquire(RwMode::Write).await.unwrap();

        let err = stale.release().await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));

        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn double_acquire_on_one_instance_is_misuse() {
        let store = DeterministicStore::new();
        let mut lock = RwLock::new(store, "cfg", quick_config(2000));

        let guard = lock.acquire(RwMode::Read).await.unwrap();
        std::mem::forget(guard);

        let err = lock.acquire(RwMode::Read).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Misuse { .. }));
    }
}
