//! Message codecs
//!
//! A [`Codec`] converts between bytes and a JSON value tree. [`CodecExt`]
//! adds typed `encode`/`decode` on top of any codec, so codecs stay usable as
//! trait objects.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// How strictly to parse incoming bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeMethod {
    /// Bytes must be exactly one well-formed document
    #[default]
    Strict,
    /// Tolerate byte-order marks and surrounding padding
    Lenient,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialise: {0}")]
    Serialise(String),

    #[error("failed to deserialise: {0}")]
    Deserialise(String),
}

/// Byte-level encoding of messages
pub trait Codec: Send + Sync {
    /// Encode a value tree
    fn serialise(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes into a value tree
    fn deserialise(&self, data: &[u8], method: DecodeMethod) -> Result<Value, CodecError>;
}

/// Typed helpers for any [`Codec`]
pub trait CodecExt: Codec {
    fn encode<T: Serialize>(&self, object: &T) -> Result<Vec<u8>, CodecError> {
        let value =
            serde_json::to_value(object).map_err(|e| CodecError::Serialise(e.to_string()))?;
        self.serialise(&value)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
        method: DecodeMethod,
    ) -> Result<T, CodecError> {
        let value = self.deserialise(data, method)?;
        serde_json::from_value(value).map_err(|e| CodecError::Deserialise(e.to_string()))
    }
}

impl<C: Codec + ?Sized> CodecExt for C {}

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn serialise(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialise(e.to_string()))
    }

    fn deserialise(&self, data: &[u8], method: DecodeMethod) -> Result<Value, CodecError> {
        let data = match method {
            DecodeMethod::Strict => data,
            DecodeMethod::Lenient => {
                let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
                let is_padding = |b: &u8| b.is_ascii_whitespace() || *b == 0;
                let start = data.iter().position(|b| !is_padding(b)).unwrap_or(data.len());
                let end = data.iter().rposition(|b| !is_padding(b)).map_or(start, |i| i + 1);
                &data[start..end]
            }
        };
        serde_json::from_slice(data).map_err(|e| CodecError::Deserialise(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{TaskMessage, TaskStatus};

    #[test]
    fn test_typed_encode_decode() {
        let codec = JsonCodec::new();
        let message = TaskMessage::new("t1", "echo", 1, b"x".to_vec(), TaskStatus::NewTask);

        let bytes = codec.encode(&message).unwrap();
        let decoded: TaskMessage = codec.decode(&bytes, DecodeMethod::Strict).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_lenient_tolerates_padding() {
        let codec = JsonCodec::new();
        let mut data = UTF8_BOM.to_vec();
        data.extend_from_slice(b"  {\"a\":1}\n\0\0");

        assert!(codec.deserialise(&data, DecodeMethod::Strict).is_err());
        let value = codec.deserialise(&data, DecodeMethod::Lenient).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_decode_failure() {
        let codec = JsonCodec::new();
        let result: Result<TaskMessage, _> = codec.decode(b"not json", DecodeMethod::Lenient);
        assert!(matches!(result, Err(CodecError::Deserialise(_))));

        let result: Result<TaskMessage, _> = codec.decode(b"{}", DecodeMethod::Lenient);
        assert!(matches!(result, Err(CodecError::Deserialise(_))));
    }

    #[test]
    fn test_codec_as_trait_object() {
        let codec: Box<dyn Codec> = Box::new(JsonCodec::new());
        let bytes = codec.encode(&serde_json::json!({"k": "v"})).unwrap();
        let value: Value = codec.decode(&bytes, DecodeMethod::Strict).unwrap();
        assert_eq!(value["k"], "v");
    }
}
