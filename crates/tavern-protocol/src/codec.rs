//! Codec trait and implementations for serializing/deserializing values.
//!
//! The engine never touches the client wire format, but it does need to
//! turn properties, caches and group tables into opaque blobs when a room's
//! state is persisted. Anything implementing [`Codec`] can do that; the
//! default is [`JsonCodec`].

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
///
/// `Send + Sync + 'static` because codecs live inside long-running room
/// tasks that Tokio may move between worker threads.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// JSON blobs are larger than a binary format would be, but persisted room
/// state is written rarely and is much easier to inspect when something goes
/// wrong during a restore.
///
/// ## Example
///
/// ```rust
/// use tavern_protocol::{Codec, Hashtable, JsonCodec};
///
/// let codec = JsonCodec;
/// let table = Hashtable::new().with(1i64, "v1");
///
/// let bytes = codec.encode(&table).unwrap();
/// let decoded: Hashtable = codec.decode(&bytes).unwrap();
/// assert_eq!(table, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
