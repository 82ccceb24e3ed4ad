//! Time-bounded, fenced ownership of a single store key.

use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rand::Rng;
use tracing::debug;
use tracing::warn;

use super::error::CoordinationError;
use crate::store::AtomicStore;

/// A TTL-bounded ownership record over one resource key.
///
/// The owner token is regenerated on every acquisition and is the sole
/// fencing mechanism: a delayed or duplicate release can never destroy a
/// lease it does not own, because release and renewal are conditioned on
/// the token server-side. Only the store-held entry is authoritative;
/// this value is the local record of what was acquired.
///
/// A lease ends by explicit [`release`](Lease::release) or by store-side
/// TTL expiry, which needs no client action and is the sole recovery
/// mechanism for a crashed holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    owner: String,
    ttl: Duration,
    acquired_at_ms: u64,
}

impl Lease {
    /// Try to take ownership of `key` for `ttl`.
    ///
    /// Generates a fresh random owner token and claims the key iff it is
    /// absent (or expired). Returns `None` when someone else holds it.
    ///
    /// Cancellation-safe: if the calling task is dropped while the
    /// acquisition write is in flight, a compensating fenced release is
    /// spawned - a no-op if the write never landed.
    pub async fn acquire<S>(store: &Arc<S>, key: &str, ttl: Duration) -> Result<Option<Lease>, CoordinationError>
    where
        S: AtomicStore + ?Sized + 'static,
    {
        let lease = Lease {
            key: key.to_string(),
            owner: fresh_owner_token(),
            ttl,
            acquired_at_ms: now_unix_ms(),
        };

        let mut rollback = LeaseRollback::armed(Arc::clone(store), lease.clone());
        let outcome = store.acquire_if_absent(key, &lease.owner, ttl).await;
        match outcome {
            Ok(true) => {
                rollback.disarm();
                debug!(key, ttl_ms = ttl.as_millis() as u64, "lease acquired");
                Ok(Some(lease))
            }
            Ok(false) => {
                rollback.disarm();
                Ok(None)
            }
            // Outcome unknown; leave the rollback armed so its drop
            // attempts the fenced release.
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lease.
    ///
    /// Returns false when the lease had already been reclaimed by TTL
    /// expiry (and possibly re-acquired by another owner): the caller
    /// never truly held it at release time. That is a result, not an
    /// error - callers that require exclusivity up to release surface it
    /// as [`CoordinationError::NotOwner`].
    pub async fn release<S>(&self, store: &S) -> Result<bool, CoordinationError>
    where
        S: AtomicStore + ?Sized,
    {
        let owned = store.release_if_owner(&self.key, &self.owner).await?;
        if owned {
            debug!(key = %self.key, "lease released");
        } else {
            warn!(key = %self.key, "lease was already reclaimed at release");
        }
        Ok(owned)
    }

    /// Extend the lease by `ttl` from now.
    ///
    /// Returns false when the lease was lost.
    pub async fn renew<S>(&self, store: &S, ttl: Duration) -> Result<bool, CoordinationError>
    where
        S: AtomicStore + ?Sized,
    {
        let owned = store.refresh_ttl(&self.key, &self.owner, ttl).await?;
        if owned {
            debug!(key = %self.key, ttl_ms = ttl.as_millis() as u64, "lease renewed");
        }
        Ok(owned)
    }

    /// The resource key this lease covers.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The fencing token identifying this acquisition.
    pub fn owner_token(&self) -> &str {
        &self.owner
    }

    /// The TTL requested at acquisition.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// When the lease was acquired, in Unix milliseconds.
    pub fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }
}

/// Spawns a best-effort fenced release when dropped while armed.
///
/// Used to cover the window in which an acquisition write may have
/// committed but the caller was cancelled before learning the outcome.
/// Safe to fire unconditionally: the release is fenced by the owner token.
pub(crate) struct LeaseRollback<S: AtomicStore + ?Sized + 'static> {
    store: Arc<S>,
    lease: Option<Lease>,
}

impl<S: AtomicStore + ?Sized + 'static> LeaseRollback<S> {
    pub(crate) fn armed(store: Arc<S>, lease: Lease) -> Self {
        Self { store, lease: Some(lease) }
    }

    pub(crate) fn disarm(&mut self) {
        self.lease = None;
    }
}

impl<S: AtomicStore + ?Sized + 'static> Drop for LeaseRollback<S> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.release_if_owner(lease.key(), lease.owner_token()).await {
                Ok(released) => {
                    debug!(key = %lease.key(), released, "compensating release after cancellation")
                }
                Err(e) => {
                    debug!(key = %lease.key(), error = %e, "compensating release failed (lease will expire via TTL)")
                }
            }
        });
    }
}

/// 128-bit random owner token, hex encoded.
fn fresh_owner_token() -> String {
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}

/// Current Unix timestamp in milliseconds.
///
/// Falls back to 0 rather than panicking if system time is before the
/// epoch.
pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
