//! Wire frames of the framed RPC protocol.
//!
//! Each frame is one length-delimited message (4-byte big-endian length
//! prefix, see [`codec`]) holding a `MessagePack` map. Payloads are opaque
//! bytes that the endpoint decodes with its own types.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use switchyard_core::Headers;
use tokio_util::codec::LengthDelimitedCodec;

/// Frames larger than this are rejected by the codec.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Length-delimited codec shared by the server and the client transport.
#[must_use]
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Errors a peer reports instead of a response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcErrorCode {
    Timeout,
    Cancelled,
    Busy,
    Declined,
    Unexpected,
    BadRequest,
    NetworkError,
}

impl RpcErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RpcErrorCode::Timeout => "timeout",
            RpcErrorCode::Cancelled => "cancelled",
            RpcErrorCode::Busy => "busy",
            RpcErrorCode::Declined => "declined",
            RpcErrorCode::Unexpected => "unexpected",
            RpcErrorCode::BadRequest => "bad-request",
            RpcErrorCode::NetworkError => "network-error",
        }
    }

    /// Code reported for a system failure rendered with `status`.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 404 | 405 => RpcErrorCode::BadRequest,
            503 => RpcErrorCode::Busy,
            504 => RpcErrorCode::Timeout,
            _ => RpcErrorCode::Unexpected,
        }
    }
}

/// Result carried by a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcStatus {
    Success,
    /// A declared business exception; the payload is its encoded body.
    ApplicationError { variant: String },
    /// The call failed before producing a result.
    SystemError { code: RpcErrorCode, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequestFrame {
    pub id: u64,
    /// `Service::method`.
    pub procedure: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Remaining caller budget in milliseconds; `0` means none.
    #[serde(default)]
    pub ttl_ms: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponseFrame {
    pub id: u64,
    pub status: RpcStatus,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl RpcResponseFrame {
    #[must_use]
    pub fn system_error(id: u64, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            status: RpcStatus::SystemError {
                code,
                message: message.into(),
            },
            headers: BTreeMap::new(),
            payload: Vec::new(),
        }
    }
}

/// Encodes a frame body.
///
/// # Errors
///
/// Returns an error when the frame cannot be serialized.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Bytes, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(frame).map(Bytes::from)
}

/// Decodes a frame body.
///
/// # Errors
///
/// Returns an error when the bytes are not a valid frame.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// Flattens headers to the single-valued map carried in frames.
#[must_use]
pub fn frame_headers(headers: &Headers) -> BTreeMap<String, String> {
    headers.to_single_map()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_survives_the_wire() {
        let frame = RpcRequestFrame {
            id: 7,
            procedure: "Bar::hello".into(),
            headers: BTreeMap::from([("x-request-uuid".to_string(), "abc".to_string())]),
            ttl_ms: 250,
            payload: vec![0x81, 0xa1, 0x61, 0x01],
        };
        let decoded: RpcRequestFrame = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn system_error_carries_code_and_message() {
        let frame = RpcResponseFrame::system_error(3, RpcErrorCode::Timeout, "deadline exceeded");
        let decoded: RpcResponseFrame = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        assert_eq!(
            decoded.status,
            RpcStatus::SystemError {
                code: RpcErrorCode::Timeout,
                message: "deadline exceeded".into()
            }
        );
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn status_maps_to_error_code() {
        assert_eq!(RpcErrorCode::from_status(400), RpcErrorCode::BadRequest);
        assert_eq!(RpcErrorCode::from_status(504), RpcErrorCode::Timeout);
        assert_eq!(RpcErrorCode::from_status(500), RpcErrorCode::Unexpected);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        assert_eq!(codec().max_frame_length(), MAX_FRAME_LENGTH);
    }
}
