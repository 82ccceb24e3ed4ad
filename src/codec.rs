//! Value encoding contract for the collection types.
//!
//! Collections store application values as opaque bytes; a [`Codec`] turns
//! values into bytes and back, and must round-trip exactly for every value
//! it accepts. The representable shapes are declared by the serde data
//! model - there is no open-ended fallback for arbitrary objects.
//!
//! The synchronization primitives never use a codec: they store only small
//! fixed-format tokens and counters.

use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::Snafu;

/// Errors from encoding or decoding a stored value.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CodecError {
    /// The value could not be encoded.
    #[snafu(display("encode failed: {reason}"))]
    Encode {
        /// What went wrong.
        reason: String,
    },

    /// The stored bytes could not be decoded.
    #[snafu(display("decode failed: {reason}"))]
    Decode {
        /// What went wrong.
        reason: String,
    },
}

/// Turns values into storable bytes and back.
///
/// `decode(encode(v))` must equal `v` for every value the codec accepts.
pub trait Codec: Send + Sync {
    /// Encode a value into bytes.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes back into a value.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec over the serde data model.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| EncodeSnafu { reason: e.to_string() }.build())
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeSnafu { reason: e.to_string() }.build())
    }
}
