//! Fixed limits and defaults.
//!
//! Every unbounded quantity gets an explicit cap so a misbehaving client
//! cannot grow store-side state without limit.

/// Key namespace used when a config does not override it.
pub const DEFAULT_NAMESPACE: &str = "fenceline";

/// Maximum concurrent readers tracked per reader/writer lock.
pub const MAX_RWLOCK_READERS: i64 = 4096;

/// Maximum writers that may register intent on one reader/writer lock.
pub const MAX_PENDING_WRITERS: i64 = 1024;

/// Transient store errors retried before surfacing as unavailable.
pub const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Delay between transient-error retries in milliseconds.
pub const TRANSIENT_RETRY_DELAY_MS: u64 = 20;

/// Poll interval for backends without change notification, in milliseconds.
pub const WAIT_POLL_INTERVAL_MS: u64 = 50;
