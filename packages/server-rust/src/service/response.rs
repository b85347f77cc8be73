//! Response writer with a one-shot commit.
//!
//! State machine: `Pending -> Committed -> Flushed`. Exactly one write may
//! commit the response; any later write is logged and dropped. Writes after
//! the flush are logged at error level, never panicked on.

use bytes::Bytes;
use serde::Serialize;
use switchyard_core::{codec, ErrorBody, GatewayError, Headers, PayloadFormat};

use super::request::Protocol;

/// Lifecycle of a [`ServerResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Pending,
    Committed,
    Flushed,
}

/// What the transport writes to the wire once the response is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    pub content_type: String,
    /// Declared business-exception variant, for protocols that carry one.
    pub exception: Option<String>,
    /// Set when the response represents a system failure.
    pub error_message: Option<String>,
}

/// Outbound side of one inbound request.
#[derive(Debug)]
pub struct ServerResponse {
    protocol: Protocol,
    state: ResponseState,
    status: Option<u16>,
    headers: Headers,
    body: Bytes,
    content_type: String,
    error: Option<GatewayError>,
    error_message: Option<String>,
    exception: Option<String>,
    suppressed_writes: u32,
}

impl ServerResponse {
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            state: ResponseState::Pending,
            status: None,
            headers: Headers::new(),
            body: Bytes::new(),
            content_type: protocol.payload_format().content_type().to_string(),
            error: None,
            error_message: None,
            exception: None,
            suppressed_writes: 0,
        }
    }

    fn try_commit(&mut self, status: u16) -> bool {
        match self.state {
            ResponseState::Pending => {
                self.state = ResponseState::Committed;
                self.status = Some(status);
                true
            }
            ResponseState::Committed => {
                self.suppressed_writes += 1;
                tracing::warn!(
                    committed_status = self.status,
                    attempted_status = status,
                    "Response already committed, write suppressed"
                );
                false
            }
            ResponseState::Flushed => {
                self.suppressed_writes += 1;
                tracing::error!(
                    attempted_status = status,
                    "Write after response flush, write suppressed"
                );
                false
            }
        }
    }

    fn merge_headers(&mut self, headers: Option<Headers>) {
        if let Some(headers) = headers {
            for (name, values) in headers.iter() {
                for value in values {
                    self.headers.add(name, value.clone());
                }
            }
        }
    }

    /// Commits a JSON body.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, status: u16, headers: Option<Headers>, body: &T) {
        self.write_encoded(PayloadFormat::Json, status, headers, body);
    }

    /// Commits a body in the protocol's payload format.
    pub fn write_payload<T: Serialize + ?Sized>(&mut self, status: u16, headers: Option<Headers>, body: &T) {
        self.write_encoded(self.protocol.payload_format(), status, headers, body);
    }

    fn write_encoded<T: Serialize + ?Sized>(
        &mut self,
        format: PayloadFormat,
        status: u16,
        headers: Option<Headers>,
        body: &T,
    ) {
        match codec::encode(format, body) {
            Ok(bytes) => {
                if self.try_commit(status) {
                    self.merge_headers(headers);
                    self.body = Bytes::from(bytes);
                    self.content_type = format.content_type().to_string();
                }
            }
            Err(err) => {
                let envelope = GatewayError::internal("Could not serialize response").with_cause(err);
                self.send_error(500, "Could not serialize response", Some(envelope));
            }
        }
    }

    /// Commits raw bytes. `content_type` overrides the protocol default.
    pub fn write_bytes(
        &mut self,
        status: u16,
        headers: Option<Headers>,
        body: Bytes,
        content_type: Option<&str>,
    ) {
        if self.try_commit(status) {
            self.merge_headers(headers);
            self.body = body;
            if let Some(ct) = content_type {
                self.content_type = ct.to_string();
            }
        }
    }

    /// Commits a declared business exception.
    pub fn write_exception<T: Serialize + ?Sized>(
        &mut self,
        variant: &str,
        status: u16,
        headers: Option<Headers>,
        body: &T,
    ) {
        let committed_before = self.state != ResponseState::Pending;
        self.write_payload(status, headers, body);
        if !committed_before && self.error.is_none() {
            self.exception = Some(variant.to_string());
        }
    }

    /// Commits an already-encoded business exception, as relayed from
    /// another host.
    pub fn write_raw_exception(&mut self, variant: &str, status: u16, headers: Option<Headers>, body: Bytes) {
        if self.try_commit(status) {
            self.merge_headers(headers);
            self.body = body;
            self.exception = Some(variant.to_string());
        }
    }

    /// Commits an error response. `message` may reach the caller; `cause`
    /// is kept for logging and metrics only.
    pub fn send_error(&mut self, status: u16, message: impl Into<String>, cause: Option<GatewayError>) {
        if !self.try_commit(status) {
            return;
        }
        let message = message.into();
        let body = ErrorBody {
            message: message.clone(),
            kind: cause.as_ref().map(GatewayError::kind),
        };
        if self.protocol == Protocol::Http {
            // ErrorBody always serializes.
            self.body = serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default();
            self.content_type = PayloadFormat::Json.content_type().to_string();
        }
        self.error_message = Some(message);
        self.error = cause;
    }

    /// Commits `err` using its rendered status and message.
    pub fn send_gateway_error(&mut self, err: GatewayError) {
        let status = err.http_status();
        let message = err.message().to_string();
        self.send_error(status, message, Some(err));
    }

    /// Marks the response delivered and returns what should be written.
    ///
    /// A response flushed while still pending is treated as a 500: every
    /// request must produce exactly one commit.
    pub fn flush(&mut self) -> Option<FlushedResponse> {
        match self.state {
            ResponseState::Flushed => {
                tracing::error!("Response flushed twice");
                return None;
            }
            ResponseState::Pending => {
                self.send_error(500, "No response was written", None);
            }
            ResponseState::Committed => {}
        }
        self.state = ResponseState::Flushed;
        Some(FlushedResponse {
            status: self.status.unwrap_or(500),
            headers: self.headers.clone(),
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            exception: self.exception.clone(),
            error_message: self.error_message.clone(),
        })
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn state(&self) -> ResponseState {
        self.state
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state != ResponseState::Pending
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Header access for post-phase middleware. Changes after flush are
    /// never sent.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn error(&self) -> Option<&GatewayError> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    /// Number of writes dropped because the response was already committed.
    #[must_use]
    pub fn suppressed_writes(&self) -> u32 {
        self.suppressed_writes
    }
}
