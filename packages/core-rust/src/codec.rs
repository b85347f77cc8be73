//! Payload encodings shared by the HTTP and framed RPC paths.
//!
//! HTTP bodies are JSON. Framed RPC payloads are `MessagePack` with named
//! fields so either side can add optional fields without breaking the other.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json encode failed: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error("json decode failed: {0}")]
    JsonDecode(#[source] serde_json::Error),
    #[error("msgpack encode failed: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode failed: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Wire encoding of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PayloadFormat {
    #[default]
    Json,
    MsgPack,
}

impl PayloadFormat {
    /// MIME type advertised for this format.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            PayloadFormat::Json => "application/json",
            PayloadFormat::MsgPack => "application/msgpack",
        }
    }
}

/// Encodes `value` in `format`.
///
/// # Errors
///
/// Returns a [`CodecError`] when serialization fails.
pub fn encode<T: Serialize + ?Sized>(format: PayloadFormat, value: &T) -> Result<Vec<u8>, CodecError> {
    match format {
        PayloadFormat::Json => serde_json::to_vec(value).map_err(CodecError::JsonEncode),
        PayloadFormat::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
    }
}

/// Decodes `bytes` as `T` in `format`.
///
/// # Errors
///
/// Returns a [`CodecError`] when the bytes do not describe a `T`.
pub fn decode<T: DeserializeOwned>(format: PayloadFormat, bytes: &[u8]) -> Result<T, CodecError> {
    match format {
        PayloadFormat::Json => serde_json::from_slice(bytes).map_err(CodecError::JsonDecode),
        PayloadFormat::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[test]
    fn msgpack_uses_named_fields() {
        let bytes = encode(
            PayloadFormat::MsgPack,
            &Sample {
                name: "a".into(),
                count: 2,
            },
        )
        .unwrap();
        // Map-encoded structs tolerate a reader that lacks `count`.
        #[derive(Deserialize)]
        struct NameOnly {
            name: String,
        }
        let partial: NameOnly = decode(PayloadFormat::MsgPack, &bytes).unwrap();
        assert_eq!(partial.name, "a");
    }

    #[test]
    fn json_decode_failure_is_reported() {
        let err = decode::<Sample>(PayloadFormat::Json, b"{\"nope\":1}").unwrap_err();
        assert!(matches!(err, CodecError::JsonDecode(_)));
    }

    #[test]
    fn missing_optional_field_defaults() {
        let s: Sample = decode(PayloadFormat::Json, br#"{"name":"x"}"#).unwrap();
        assert_eq!(s, Sample { name: "x".into(), count: 0 });
    }
}
