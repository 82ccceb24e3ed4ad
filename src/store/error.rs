//! Error type for store adapter operations.

use snafu::Snafu;

/// Errors from the backing store.
///
/// Store errors propagate immediately; the only retry below the
/// coordination layer is the bounded transient-error retry inside the
/// networked backends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The store is unreachable or an operation failed.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The key holds a value of a different kind than the operation expects.
    #[snafu(display("key '{key}' holds a value of the wrong kind"))]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// Data under the key could not be interpreted.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    Corrupted {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },
}
