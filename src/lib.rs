//! Distributed synchronization primitives over a shared key-value store.
//!
//! `fenceline` builds an exclusive [`Lock`], a reader/writer [`RwLock`], a
//! counting [`Semaphore`], and a token-bucket [`RateLimiter`] on top of a
//! networked key-value store that offers atomic compare-and-set style
//! operations and key expiry but no locking API of its own. Correctness
//! holds across independent, crash-prone processes with unsynchronized
//! clocks: the store's atomicity and TTL enforcement are the only sources
//! of truth.
//!
//! Any backend implementing [`AtomicStore`] can substitute.
//! [`DeterministicStore`] is the in-process reference; `RedisStore`
//! (cargo feature `redis`) is the networked deployment.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fenceline::{DeterministicStore, Lock, LockConfig};
//!
//! # async fn example() -> Result<(), fenceline::CoordinationError> {
//! let store = DeterministicStore::new();
//! let lock = Lock::new(store, "reindex", LockConfig {
//!     ttl: Duration::from_secs(30),
//!     ..LockConfig::default()
//! });
//!
//! let guard = lock.acquire().await?;
//! // ... critical section, fenced by guard.owner_token() ...
//! guard.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees and their limits
//!
//! - A crashed holder recovers passively: its lease or counted entry
//!   lapses via store-side TTL. There is no other failure detection.
//! - No FIFO fairness between waiters: whichever waiter retries first
//!   after a release wins, regardless of arrival order.
//! - A release that comes after the TTL already lapsed reports
//!   [`CoordinationError::NotOwner`] - the critical section was not
//!   exclusively protected to the end, and that is surfaced, never
//!   swallowed.
//! - An [`RwLock`] instance tracks its held mode locally to reject
//!   misuse; use one instance per concurrent caller.

pub mod codec;
pub mod collections;
pub mod constants;
pub mod coordination;
pub mod store;

pub use codec::Codec;
pub use codec::CodecError;
pub use codec::JsonCodec;
pub use collections::CollectionError;
pub use collections::SharedList;
pub use collections::SharedMap;
pub use collections::SharedQueue;
pub use coordination::CoordinationError;
pub use coordination::Lease;
pub use coordination::Lock;
pub use coordination::LockConfig;
pub use coordination::LockGuard;
pub use coordination::RateLimiter;
pub use coordination::RateLimiterConfig;
pub use coordination::RwLock;
pub use coordination::RwLockConfig;
pub use coordination::RwLockGuard;
pub use coordination::RwMode;
pub use coordination::Semaphore;
pub use coordination::SemaphoreConfig;
pub use coordination::SemaphorePermit;
pub use coordination::WaitStrategy;
pub use store::AdjustBounds;
pub use store::AdjustOutcome;
pub use store::AtomicStore;
pub use store::CollectionStore;
pub use store::DeterministicStore;
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::RefillPolicy;
pub use store::StoreError;
pub use store::TakeOutcome;
