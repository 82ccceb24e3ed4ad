//! Store adapter: the atomic primitives every coordination type is built on.
//!
//! The backing store needs no native locking API. It must offer
//! set-if-absent with expiry, fenced delete/refresh, a bounded atomic
//! counter, one scripted refill-and-take step, and a way to wait for a key
//! to change. Anything that can express those atomically can substitute;
//! [`DeterministicStore`] is the in-process reference and `RedisStore`
//! (cargo feature `redis`) the networked deployment.
//!
//! Every method is a single round-trip or a single atomic script execution
//! on the store side - never a client-side compare-then-act pair, which
//! would race between processes.

mod error;
pub mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::DeterministicStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Bounds applied by [`AtomicStore::atomic_adjust`].
#[derive(Debug, Clone, Copy)]
pub struct AdjustBounds {
    /// Smallest value the counter may reach.
    pub min: i64,
    /// Largest value the counter may reach.
    pub max: i64,
    /// When set, every applied adjustment refreshes the counter key's
    /// expiry. Counters owned by crash-prone holders use this so a dead
    /// holder's contribution lapses passively.
    pub ttl: Option<Duration>,
}

impl AdjustBounds {
    /// Bounds with no expiry refresh.
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max, ttl: None }
    }

    /// Refresh the counter key's expiry on every applied adjustment.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of a bounded counter adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// The adjustment was applied; carries the new value.
    Applied(i64),
    /// The adjustment would leave the bounds; nothing was written.
    Rejected {
        /// The unchanged counter value.
        current: i64,
    },
}

/// Refill parameters for [`AtomicStore::bucket_take`].
///
/// The bucket capacity equals `rate`: a full period of idleness refills the
/// bucket completely and no further.
#[derive(Debug, Clone, Copy)]
pub struct RefillPolicy {
    /// Tokens replenished per `period`; also the bucket capacity.
    pub rate: u32,
    /// Window over which `rate` tokens are replenished.
    pub period: Duration,
}

/// Result of a token bucket admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeOutcome {
    /// One token was consumed.
    Admitted {
        /// Whole tokens left in the bucket after this admission.
        remaining: u32,
    },
    /// Not enough tokens; the bucket was not mutated.
    Throttled {
        /// Time until one token will have been replenished.
        retry_after: Duration,
    },
}

/// Atomic operations required by the synchronization primitives.
///
/// Implementations must apply each operation atomically with respect to all
/// other clients of the same store. TTLs are enforced store-side: an
/// expired key behaves exactly like an absent one with no client action.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Set `key` to `owner` with expiry `ttl` iff the key is absent.
    ///
    /// Returns true iff the key is now owned by `owner`.
    async fn acquire_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` iff its value equals `owner`.
    ///
    /// Returns false when the caller no longer owns the key - it expired
    /// and may have been re-acquired by someone else.
    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Extend the expiry of `key` to `ttl` from now iff its value equals `owner`.
    async fn refresh_ttl(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add `delta` to the counter at `key` as one atomic check-and-write.
    ///
    /// An absent key reads as 0. The write is rejected - and nothing
    /// stored - when the result would leave `[bounds.min, bounds.max]`.
    /// A counter that reaches 0 is removed, so an idle counter key does
    /// not linger.
    async fn atomic_adjust(&self, key: &str, delta: i64, bounds: AdjustBounds) -> Result<AdjustOutcome, StoreError>;

    /// Read the counter at `key` without mutating. Absent reads as 0.
    async fn read_counter(&self, key: &str) -> Result<i64, StoreError>;

    /// The scripted refill-and-take step of the token bucket.
    ///
    /// In one atomic execution: replenish the bucket by elapsed time since
    /// its last refill (capped at capacity), then consume one token iff at
    /// least one is available, else leave the bucket untouched. Elapsed
    /// time is measured by the store backend, not the caller, so admission
    /// never depends on synchronized client clocks.
    async fn bucket_take(&self, key: &str, refill: &RefillPolicy) -> Result<TakeOutcome, StoreError>;

    /// Suspend until the value at `key` changes or `timeout` elapses.
    ///
    /// Returns true when a change was observed. Backed by notification
    /// where the store supports it and bounded polling otherwise. The
    /// signal is advisory - a change may be missed between a caller's
    /// check and the wait - so callers always re-verify after waking.
    async fn wait_for_change(&self, key: &str, timeout: Duration) -> Result<bool, StoreError>;
}

#[async_trait]
impl<T: AtomicStore + ?Sized> AtomicStore for Arc<T> {
    async fn acquire_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).acquire_if_absent(key, owner, ttl).await
    }

    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        (**self).release_if_owner(key, owner).await
    }

    async fn refresh_ttl(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).refresh_ttl(key, owner, ttl).await
    }

    async fn atomic_adjust(&self, key: &str, delta: i64, bounds: AdjustBounds) -> Result<AdjustOutcome, StoreError> {
        (**self).atomic_adjust(key, delta, bounds).await
    }

    async fn read_counter(&self, key: &str) -> Result<i64, StoreError> {
        (**self).read_counter(key).await
    }

    async fn bucket_take(&self, key: &str, refill: &RefillPolicy) -> Result<TakeOutcome, StoreError> {
        (**self).bucket_take(key, refill).await
    }

    async fn wait_for_change(&self, key: &str, timeout: Duration) -> Result<bool, StoreError> {
        (**self).wait_for_change(key, timeout).await
    }
}

/// Aggregate commands consumed by the collection types.
///
/// These proxy the store's native hash and list operations and carry no
/// coordination logic. Values are opaque bytes produced by the codec.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Remove `key` and everything stored under it.
    async fn remove_key(&self, key: &str) -> Result<(), StoreError>;

    /// Set `field` in the hash at `key`.
    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Set `field` iff it is absent. Returns true when the write happened.
    async fn hash_set_if_absent(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    /// Get `field` from the hash at `key`.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete `field` from the hash at `key`. Returns true when it existed.
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Number of fields in the hash at `key`.
    async fn hash_len(&self, key: &str) -> Result<u64, StoreError>;

    /// All field names in the hash at `key`.
    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// All field/value pairs in the hash at `key`.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Append to the list at `key`. Returns the new length.
    async fn list_push_back(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError>;

    /// Pop the head of the list at `key`.
    async fn list_pop_front(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Pop the tail of the list at `key`.
    async fn list_pop_back(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Element at `index` (negative counts from the tail).
    async fn list_get(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the element at `index`. Returns false when out of range.
    async fn list_set(&self, key: &str, index: i64, value: Vec<u8>) -> Result<bool, StoreError>;

    /// Length of the list at `key`.
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Elements from `start` through `stop` inclusive, negatives from the tail.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Remove up to `count` head-to-tail occurrences of `value` (0 = all).
    ///
    /// Returns the number removed.
    async fn list_remove(&self, key: &str, value: &[u8], count: u64) -> Result<u64, StoreError>;

    /// Pop the head of the list, waiting up to `timeout` for an element.
    async fn list_pop_front_timeout(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError>;
}
