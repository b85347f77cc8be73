//! Downstream responses as seen by generated client code.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use switchyard_core::{codec, CodecError, Headers, PayloadFormat};

use crate::service::workflow::{BusinessException, NoException};

/// Raw answer of the final attempt of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    /// Exception variant reported by the peer, if its protocol carries one.
    pub exception: Option<String>,
    pub format: PayloadFormat,
}

impl ClientResponse {
    /// Decodes the body. An empty body decodes to `None`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when the body is not a `T`.
    pub fn read_and_unmarshal<T: DeserializeOwned>(&self) -> Result<Option<T>, CodecError> {
        if self.body.is_empty() {
            return Ok(None);
        }
        codec::decode(self.format, &self.body).map(Some)
    }
}

/// Cause attached to a protocol error for an undeclared status. Keeps the
/// raw body so callers can inspect what the peer sent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unexpected status {status} ({} body bytes)", body.len())]
pub struct UnexpectedStatus {
    pub status: u16,
    pub body: Bytes,
}

/// A business exception a client method declares.
///
/// HTTP peers signal exceptions with a declared status; RPC peers name the
/// variant. Implementations return `None` when the response is not one of
/// their variants.
pub trait DeclaredException: BusinessException + Sized {
    fn from_response(
        status: u16,
        variant: Option<&str>,
        body: &[u8],
        format: PayloadFormat,
    ) -> Option<Result<Self, CodecError>>;
}

impl DeclaredException for NoException {
    fn from_response(
        _status: u16,
        _variant: Option<&str>,
        _body: &[u8],
        _format: PayloadFormat,
    ) -> Option<Result<Self, CodecError>> {
        None
    }
}
