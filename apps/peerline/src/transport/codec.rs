use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serializes an application value into the bytes the fragmenter splits.
///
/// The encoding is JSON, so values come back as [`Value`]. Strings,
/// integers, finite floats, arrays and maps round-trip exactly. JSON has no
/// NaN or infinity: non-finite floats are written as `null`.
pub fn encode_message<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

pub fn decode_message(bytes: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
