//! Exclusive lock over a single lease.
//!
//! Provides mutual exclusion across distributed processes with:
//! - A fresh fencing token per acquisition for safe release
//! - TTL-based expiration for crash recovery
//! - Optional background heartbeat renewal for long critical sections
//! - Exponential backoff with jitter between acquisition attempts

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::error::CoordinationError;
use super::error::NotOwnerSnafu;
use super::lease::Lease;
use super::wait::WaitStrategy;
use crate::constants::DEFAULT_NAMESPACE;
use crate::store::AtomicStore;
use crate::store::keys;

/// Configuration for an exclusive lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Key namespace.
    pub namespace: String,
    /// Lease time-to-live. The critical section must finish or renew
    /// within this window to stay exclusively protected.
    pub ttl: Duration,
    /// Retry behavior while the lock is contended.
    pub wait: WaitStrategy,
    /// When set, a background task renews the lease on this interval
    /// while the guard is held. Should be well under `ttl`.
    pub heartbeat: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: Duration::from_secs(30),
            wait: WaitStrategy::default(),
            heartbeat: None,
        }
    }
}

/// A distributed mutual-exclusion lock.
///
/// At most one live, non-expired lease exists per lock key; the store's
/// atomic set-if-absent is the only arbiter. Instances are cheap handles -
/// any number of processes may contend through their own.
pub struct Lock<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    key: String,
    config: LockConfig,
}

impl<S: AtomicStore + ?Sized + 'static> Lock<S> {
    /// Create a lock handle for `name`.
    pub fn new(store: Arc<S>, name: &str, config: LockConfig) -> Self {
        let key = keys::lock_key(&config.namespace, name);
        Self { store, key, config }
    }

    /// Acquire the lock, waiting through the configured strategy.
    ///
    /// Fails with [`CoordinationError::AcquisitionTimeout`] once the wait
    /// budget is spent.
    pub async fn acquire(&self) -> Result<LockGuard<S>, CoordinationError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            if let Some(guard) = self.try_acquire().await? {
                return Ok(guard);
            }
            debug!(key = %self.key, attempt, "lock held, backing off");
            let resource = format!("lock '{}'", self.key);
            self.config.wait.pause(&self.store, &self.key, &resource, started, attempt).await?;
            attempt += 1;
        }
    }

    /// Try to acquire the lock without waiting.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard<S>>, CoordinationError> {
        let Some(lease) = Lease::acquire(&self.store, &self.key, self.config.ttl).await? else {
            return Ok(None);
        };

        let heartbeat = self
            .config
            .heartbeat
            .map(|interval| Heartbeat::spawn(Arc::clone(&self.store), lease.clone(), self.config.ttl, interval));

        Ok(Some(LockGuard {
            store: Arc::clone(&self.store),
            lease,
            heartbeat,
            released: false,
        }))
    }

    /// The fully-namespaced lock key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Background lease renewal, stopped the instant release begins.
struct Heartbeat {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn<S>(store: Arc<S>, lease: Lease, ttl: Duration, interval: Duration) -> Self
    where
        S: AtomicStore + ?Sized + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the lease is fresh.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                match lease.renew(&*store, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(key = %lease.key(), "lease lost, stopping heartbeat");
                        return;
                    }
                    Err(e) => {
                        // Keep trying; if the store stays down the lease
                        // lapses via TTL, which is the crash story anyway.
                        warn!(key = %lease.key(), error = %e, "lease renewal failed");
                    }
                }
            }
        });
        Self { stop, task }
    }

    fn halt(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Guard held for the duration of the critical section.
///
/// Dropping the guard performs a best-effort fenced release on a spawned
/// task; the TTL remains the backstop. Call [`release`](LockGuard::release)
/// to learn whether exclusivity actually held to the end.
pub struct LockGuard<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    lease: Lease,
    heartbeat: Option<Heartbeat>,
    released: bool,
}

impl<S: AtomicStore + ?Sized + 'static> std::fmt::Debug for LockGuard<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S: AtomicStore + ?Sized + 'static> LockGuard<S> {
    /// The fencing token for this acquisition.
    ///
    /// Pass it to external services that need to reject operations from a
    /// stale holder.
    pub fn owner_token(&self) -> &str {
        self.lease.owner_token()
    }

    /// The lock key.
    pub fn key(&self) -> &str {
        self.lease.key()
    }

    /// Extend the lease by the lock's TTL.
    ///
    /// Fails with [`CoordinationError::NotOwner`] when the lease was lost.
    pub async fn renew(&self, ttl: Duration) -> Result<(), CoordinationError> {
        if self.lease.renew(&*self.store, ttl).await? {
            Ok(())
        } else {
            NotOwnerSnafu { key: self.lease.key() }.fail()
        }
    }

    /// Release the lock.
    ///
    /// Fails with [`CoordinationError::NotOwner`] when the lease had
    /// already been reclaimed - the critical section ran longer than the
    /// TTL and was not exclusively protected at the end. That condition is
    /// surfaced, never silently ignored.
    pub async fn release(mut self) -> Result<(), CoordinationError> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.halt();
        }
        self.released = true;
        if self.lease.release(&*self.store).await? {
            Ok(())
        } else {
            NotOwnerSnafu { key: self.lease.key() }.fail()
        }
    }
}

impl<S: AtomicStore + ?Sized + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.halt();
        }
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let lease = self.lease.clone();
        tokio::spawn(async move {
            match lease.release(&*store).await {
                Ok(_) => {}
                Err(e) => {
                    debug!(key = %lease.key(), error = %e, "release on drop failed (lease will expire via TTL)")
                }
            }
        });
    }
}
