//! Outbound transports.
//!
//! A [`Transport`] performs one attempt of one call: it carries headers,
//! body and deadline to the target and hands back whatever the peer said.
//! Retries, breakers, metrics and typed decoding live in
//! [`ClientCaller`](super::call::ClientCaller), so every transport stays a
//! thin adapter over its wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use switchyard_core::{GatewayError, Headers};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::options::{ClientDescriptor, ClientProtocol};
use crate::rpc::frame::{self, RpcErrorCode, RpcRequestFrame, RpcResponseFrame, RpcStatus};

/// Deadline header understood by HTTP peers, in milliseconds.
pub const CONTEXT_TTL_HEADER: &str = "Context-TTL-MS";
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
pub const GRPC_STATUS_HEADER: &str = "grpc-status";
pub const GRPC_MESSAGE_HEADER: &str = "grpc-message";
pub const RPC_SERVICE_HEADER: &str = "rpc-service";
pub const RPC_ROUTING_KEY_HEADER: &str = "rpc-routing-key";

/// Transport failure of a single attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("remote {}: {message}", code.as_str())]
    Remote { code: RpcErrorCode, message: String },

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Classifies the failure. Timeouts and connection-level failures are
    /// retryable; a peer that rejected the request is not.
    #[must_use]
    pub fn into_gateway(self) -> GatewayError {
        let message = self.to_string();
        let err = match &self {
            TransportError::Timeout(_) => GatewayError::timeout(message),
            TransportError::Http(err) if err.is_timeout() => GatewayError::timeout(message),
            TransportError::Io(_) | TransportError::Http(_) => GatewayError::transport(message),
            TransportError::Remote { code, .. } => match code {
                RpcErrorCode::Timeout => GatewayError::timeout(message),
                RpcErrorCode::Busy | RpcErrorCode::NetworkError => GatewayError::transport(message),
                RpcErrorCode::BadRequest => {
                    GatewayError::bad_request(message).with_origin(switchyard_core::Origin::Client)
                }
                RpcErrorCode::Cancelled | RpcErrorCode::Declined | RpcErrorCode::Unexpected => {
                    GatewayError::transport(message).with_retryable(false)
                }
            },
            TransportError::Codec(_) | TransportError::Protocol(_) => {
                GatewayError::protocol(message).with_origin(switchyard_core::Origin::Codec)
            }
        };
        err.with_cause(self)
    }
}

/// One attempt of an outbound call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// `Service::method` on RPC transports.
    pub procedure: String,
    pub http_method: String,
    /// Path appended to the base address on HTTP.
    pub path: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Budget of this attempt, forwarded to the peer as its deadline.
    pub timeout: Duration,
    pub base_address: String,
    pub service_name: String,
    pub routing_key: Option<String>,
}

/// What the peer answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    /// Declared exception variant reported by an RPC peer.
    pub exception: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Value of the `clienttype` tag for calls over this transport.
    fn client_type(&self) -> &'static str;

    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError>;
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, values) in headers.iter() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Protocol(format!("invalid header name {name:?}: {e}")))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Protocol(format!("invalid value for header {name}: {e}")))?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

fn from_header_map(map: &HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// HTTP/1.1 transport over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns an error when the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
        })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn client_type(&self) -> &'static str {
        ClientProtocol::Http.as_str()
    }

    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.http_method.as_bytes())
            .map_err(|e| TransportError::Protocol(format!("invalid method {}: {e}", request.http_method)))?;
        let url = format!("{}{}", request.base_address.trim_end_matches('/'), request.path);

        let mut headers = to_header_map(&request.headers)?;
        if !request.timeout.is_zero() {
            headers.insert(
                HeaderName::from_static("context-ttl-ms"),
                HeaderValue::from(millis(request.timeout)),
            );
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if !request.timeout.is_zero() {
            builder = builder.timeout(request.timeout);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = from_header_map(resp.headers());
        let body = resp.bytes().await?;
        Ok(OutboundResponse {
            status,
            headers,
            body,
            exception: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Framed RPC
// ---------------------------------------------------------------------------

/// Framed RPC transport. Each attempt dials a fresh connection, writes one
/// request frame and waits for the matching response frame.
#[derive(Debug, Default)]
pub struct FramedRpcTransport {
    next_id: AtomicU64,
}

impl FramedRpcTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for FramedRpcTransport {
    fn client_type(&self) -> &'static str {
        ClientProtocol::FramedRpc.as_str()
    }

    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut headers = request.headers;
        if let Some(key) = &request.routing_key {
            headers.set(RPC_ROUTING_KEY_HEADER, key.clone());
        }
        headers.set(RPC_SERVICE_HEADER, request.service_name.clone());

        let out = RpcRequestFrame {
            id,
            procedure: request.procedure,
            headers: frame::frame_headers(&headers),
            ttl_ms: millis(request.timeout),
            payload: request.body.to_vec(),
        };
        let bytes = frame::encode_frame(&out).map_err(|e| TransportError::Codec(e.to_string()))?;

        let stream = TcpStream::connect(&request.base_address).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, frame::codec());
        framed.send(bytes).await?;

        let raw = framed
            .next()
            .await
            .ok_or_else(|| TransportError::Protocol("connection closed before response".into()))??;
        let resp: RpcResponseFrame =
            frame::decode_frame(&raw).map_err(|e| TransportError::Codec(e.to_string()))?;
        if resp.id != id {
            return Err(TransportError::Protocol(format!(
                "response id {} does not match request id {id}",
                resp.id
            )));
        }

        let headers: Headers = resp.headers.into();
        match resp.status {
            RpcStatus::Success => Ok(OutboundResponse {
                status: 200,
                headers,
                body: Bytes::from(resp.payload),
                exception: None,
            }),
            RpcStatus::ApplicationError { variant } => Ok(OutboundResponse {
                status: 200,
                headers,
                body: Bytes::from(resp.payload),
                exception: Some(variant),
            }),
            RpcStatus::SystemError { code, message } => Err(TransportError::Remote { code, message }),
        }
    }
}

// ---------------------------------------------------------------------------
// gRPC
// ---------------------------------------------------------------------------

/// gRPC-style transport: HTTP/2 with prior knowledge, one length-prefixed
/// message per direction. The message bytes are passed through as given.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    client: reqwest::Client,
}

impl GrpcTransport {
    /// # Errors
    ///
    /// Returns an error when the HTTP/2 client cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            client: reqwest::Client::builder().http2_prior_knowledge().build()?,
        })
    }
}

/// Prefixes `message` with the uncompressed flag and its big-endian length.
#[must_use]
pub fn grpc_frame(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.len() + 5);
    buf.put_u8(0);
    buf.put_u32(u32::try_from(message.len()).unwrap_or(u32::MAX));
    buf.put_slice(message);
    buf.freeze()
}

/// Strips the 5-byte prefix from a single-message body.
///
/// # Errors
///
/// Returns a protocol error for a truncated or compressed message.
pub fn grpc_unframe(body: &Bytes) -> Result<Bytes, TransportError> {
    if body.is_empty() {
        return Ok(Bytes::new());
    }
    if body.len() < 5 {
        return Err(TransportError::Protocol("truncated grpc message prefix".into()));
    }
    if body[0] != 0 {
        return Err(TransportError::Protocol("compressed grpc messages are not supported".into()));
    }
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if body.len() < 5 + len {
        return Err(TransportError::Protocol("truncated grpc message".into()));
    }
    Ok(body.slice(5..5 + len))
}

fn grpc_code(code: u32) -> RpcErrorCode {
    match code {
        1 => RpcErrorCode::Cancelled,
        3 | 5 | 9 | 11 => RpcErrorCode::BadRequest,
        4 => RpcErrorCode::Timeout,
        8 => RpcErrorCode::Busy,
        14 => RpcErrorCode::NetworkError,
        7 | 16 => RpcErrorCode::Declined,
        _ => RpcErrorCode::Unexpected,
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn client_type(&self) -> &'static str {
        ClientProtocol::Grpc.as_str()
    }

    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError> {
        let path = request.procedure.replace("::", "/");
        let url = format!("{}/{}", request.base_address.trim_end_matches('/'), path);

        let mut headers = to_header_map(&request.headers)?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/grpc"),
        );
        headers.insert(HeaderName::from_static("te"), HeaderValue::from_static("trailers"));
        if let Ok(v) = HeaderValue::from_str(&request.service_name) {
            headers.insert(HeaderName::from_static(RPC_SERVICE_HEADER), v);
        }
        if let Some(v) = request.routing_key.as_deref().and_then(|k| HeaderValue::from_str(k).ok()) {
            headers.insert(HeaderName::from_static(RPC_ROUTING_KEY_HEADER), v);
        }
        let mut builder = self.client.post(url);
        if !request.timeout.is_zero() {
            if let Ok(v) = HeaderValue::from_str(&format!("{}m", millis(request.timeout))) {
                headers.insert(HeaderName::from_static(GRPC_TIMEOUT_HEADER), v);
            }
            builder = builder.timeout(request.timeout);
        }

        let resp = builder.headers(headers).body(grpc_frame(&request.body)).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "grpc peer answered http status {}",
                resp.status().as_u16()
            )));
        }
        let headers = from_header_map(resp.headers());
        let code = headers
            .get(GRPC_STATUS_HEADER)
            .map(str::parse::<u32>)
            .transpose()
            .map_err(|e| TransportError::Protocol(format!("invalid grpc-status: {e}")))?
            .unwrap_or(0);
        if code != 0 {
            let message = headers.get(GRPC_MESSAGE_HEADER).unwrap_or_default().to_string();
            return Err(TransportError::Remote {
                code: grpc_code(code),
                message,
            });
        }
        let body = grpc_unframe(&resp.bytes().await?)?;
        Ok(OutboundResponse {
            status: 200,
            headers,
            body,
            exception: None,
        })
    }
}

/// Builds the transport matching a client's protocol.
///
/// # Errors
///
/// Returns an error when the underlying HTTP client cannot be built.
pub fn transport_for(descriptor: &ClientDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(match descriptor.protocol {
        ClientProtocol::Http => Arc::new(HttpTransport::new()?),
        ClientProtocol::FramedRpc => Arc::new(FramedRpcTransport::new()),
        ClientProtocol::Grpc => Arc::new(GrpcTransport::new()?),
    })
}

#[cfg(test)]
mod tests {
    use switchyard_core::ErrorKind;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn grpc_prefix_round_trip() {
        let framed = grpc_frame(b"hello");
        assert_eq!(&framed[..5], &[0, 0, 0, 0, 5]);
        assert_eq!(grpc_unframe(&framed).unwrap(), Bytes::from_static(b"hello"));
        assert!(grpc_unframe(&Bytes::from_static(&[0, 0, 0])).is_err());
        assert!(grpc_unframe(&Bytes::from_static(&[1, 0, 0, 0, 0])).is_err());
    }

    #[test]
    fn transport_errors_are_classified() {
        let err = TransportError::Timeout(Duration::from_millis(5)).into_gateway();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());

        let err = TransportError::Remote {
            code: RpcErrorCode::BadRequest,
            message: "nope".into(),
        }
        .into_gateway();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(!err.is_retryable());

        let err = TransportError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)).into_gateway();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
    }

    async fn one_shot_peer(status: RpcStatus) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, frame::codec());
            let raw = framed.next().await.unwrap().unwrap();
            let req: RpcRequestFrame = frame::decode_frame(&raw).unwrap();
            let resp = RpcResponseFrame {
                id: req.id,
                status,
                headers: req.headers,
                payload: req.payload,
            };
            framed.send(frame::encode_frame(&resp).unwrap()).await.unwrap();
        });
        addr
    }

    fn rpc_request(addr: String) -> OutboundRequest {
        OutboundRequest {
            procedure: "Baz::echo".into(),
            http_method: String::new(),
            path: String::new(),
            headers: [("x-request-uuid", "u-1")].into_iter().collect(),
            body: Bytes::from_static(b"\x81\xa1a\x01"),
            timeout: Duration::from_secs(1),
            base_address: addr,
            service_name: "Baz".into(),
            routing_key: None,
        }
    }

    #[tokio::test]
    async fn framed_rpc_echo() {
        let addr = one_shot_peer(RpcStatus::Success).await;
        let resp = FramedRpcTransport::new().send(rpc_request(addr)).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from_static(b"\x81\xa1a\x01"));
        assert_eq!(resp.headers.get("x-request-uuid"), Some("u-1"));
        assert_eq!(resp.headers.get(RPC_SERVICE_HEADER), Some("Baz"));
        assert_eq!(resp.exception, None);
    }

    #[tokio::test]
    async fn framed_rpc_application_error_is_a_response() {
        let addr = one_shot_peer(RpcStatus::ApplicationError {
            variant: "NotFound".into(),
        })
        .await;
        let resp = FramedRpcTransport::new().send(rpc_request(addr)).await.unwrap();
        assert_eq!(resp.exception.as_deref(), Some("NotFound"));
    }

    #[tokio::test]
    async fn framed_rpc_system_error_is_an_error() {
        let addr = one_shot_peer(RpcStatus::SystemError {
            code: RpcErrorCode::Busy,
            message: "overloaded".into(),
        })
        .await;
        let err = FramedRpcTransport::new().send(rpc_request(addr)).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote { code: RpcErrorCode::Busy, .. }));
    }
}
