//! Named `MsgPack` encoding for every payload that crosses a mailbox.
//!
//! Payloads are encoded with `rmp_serde::to_vec_named()` so field names travel
//! with the data and receivers can be schema-tolerant. A decode failure is the
//! "malformed message" signal: callers ack and discard.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors from encoding or decoding a mailbox payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a message as named `MsgPack`.
///
/// # Errors
///
/// Returns `CodecError::Encode` if the value cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Decodes a named `MsgPack` payload into `T`.
///
/// # Errors
///
/// Returns `CodecError::Decode` if the bytes do not match `T`'s shape.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
