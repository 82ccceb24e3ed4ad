//! Store-proxied collection types.
//!
//! Typed wrappers over the store's native aggregate commands: a map over
//! hash operations, a list and a FIFO queue over list operations. They
//! contain no coordination logic of their own - concurrent writers that
//! need exclusion should wrap access in a [`Lock`](crate::Lock) or
//! [`RwLock`](crate::RwLock).
//!
//! Values pass through a [`Codec`](crate::codec::Codec); the default is
//! JSON over the serde data model.

mod list;
mod map;
mod queue;

use snafu::Snafu;

pub use list::SharedList;
pub use map::SharedMap;
pub use queue::SharedQueue;

use crate::codec::CodecError;
use crate::store::StoreError;

/// Errors from collection operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CollectionError {
    /// The backing store failed.
    #[snafu(display("store unavailable: {source}"))]
    Store {
        /// The underlying error.
        source: StoreError,
    },

    /// A value could not be encoded or decoded.
    #[snafu(display("codec error: {source}"))]
    Codec {
        /// The underlying error.
        source: CodecError,
    },
}

impl From<StoreError> for CollectionError {
    fn from(source: StoreError) -> Self {
        CollectionError::Store { source }
    }
}

impl From<CodecError> for CollectionError {
    fn from(source: CodecError) -> Self {
        CollectionError::Codec { source }
    }
}
