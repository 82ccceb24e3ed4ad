//! Distributed synchronization primitives built on the store adapter.
//!
//! - [`Lease`] - TTL-bounded, fenced ownership of a resource key
//! - [`Lock`] - mutual exclusion with optional heartbeat renewal
//! - [`RwLock`] - shared readers or one exclusive writer, with
//!   writer-preference via write-intent
//! - [`Semaphore`] - up to N concurrent holders
//! - [`RateLimiter`] - token-bucket admission control
//!
//! Correctness across processes rests entirely on the store's atomic
//! operations and TTL expiry; no in-process lock plays any role in
//! cross-process arbitration. Acquisition calls suspend the calling task
//! only at store round-trips and backoff sleeps, and are cancellable: a
//! cancelled acquire never leaves a half-acquired lease behind (a
//! committed write is compensated, an uncommitted one lapses via TTL).
//!
//! There is no FIFO fairness between waiters. A waiter that happens to
//! retry right after a release wins regardless of how long others have
//! waited - simplicity is chosen over fairness, and timeouts are purely
//! local to each caller.

mod error;
mod lease;
mod lock;
mod rate_limiter;
mod rwlock;
mod semaphore;
mod wait;

pub use error::CoordinationError;
pub use lease::Lease;
pub use lock::Lock;
pub use lock::LockConfig;
pub use lock::LockGuard;
pub use rate_limiter::RateLimiter;
pub use rate_limiter::RateLimiterConfig;
pub use rwlock::RwLock;
pub use rwlock::RwLockConfig;
pub use rwlock::RwLockGuard;
pub use rwlock::RwMode;
pub use semaphore::Semaphore;
pub use semaphore::SemaphoreConfig;
pub use semaphore::SemaphorePermit;
pub use wait::WaitStrategy;
