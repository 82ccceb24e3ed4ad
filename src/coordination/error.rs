//! Error types for the synchronization primitives.

use snafu::Snafu;

use crate::store::StoreError;

/// Errors from coordination primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinationError {
    /// Waiting exceeded the configured maximum. Recoverable; the caller
    /// may retry.
    #[snafu(display("timed out after {waited_ms}ms waiting for {resource}"))]
    AcquisitionTimeout {
        /// What was being acquired.
        resource: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A release or renewal found the lease already reassigned.
    ///
    /// The critical section outran its TTL and was not exclusively
    /// protected at release time. Always surfaced, never swallowed.
    #[snafu(display("no longer the owner of '{key}'"))]
    NotOwner {
        /// The resource key.
        key: String,
    },

    /// A bounded counter was observed outside its bounds.
    ///
    /// Structurally impossible under atomic adjustment; seeing this means
    /// the store-held state is inconsistent. Fatal - report, do not retry.
    #[snafu(display("counter '{key}' out of bounds: {observed} not within [{min}, {max}]"))]
    CapacityExceeded {
        /// The counter key.
        key: String,
        /// The value observed.
        observed: i64,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },

    /// Admission was denied for the whole wait budget. Expected and
    /// recoverable; the caller decides whether to retry.
    #[snafu(display("rate limit exceeded on '{key}', retry after {retry_after_ms}ms"))]
    RateLimitExceeded {
        /// The bucket key.
        key: String,
        /// Time until a token will have been replenished.
        retry_after_ms: u64,
    },

    /// The backing store failed or is unreachable.
    #[snafu(display("store unavailable: {source}"))]
    Store {
        /// The underlying error.
        source: StoreError,
    },

    /// The caller violated an API precondition.
    ///
    /// A programming defect rather than a distributed-state condition;
    /// reported, never auto-corrected.
    #[snafu(display("misuse: {reason}"))]
    Misuse {
        /// What the caller did wrong.
        reason: String,
    },
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Store { source }
    }
}
