//! Gateway error taxonomy.
//!
//! Every failure that crosses a module boundary is a [`GatewayError`]: a
//! classified kind, a human message, an optional boxed cause, an origin and
//! a retryable flag. The HTTP status used when an error is rendered to a
//! caller is derived from the kind unless an explicit status was attached.
//!
//! [`ErrorBuilder`] stamps a `"<class>::<name>"` location onto errors so
//! logs can tell which module produced them; [`ErrorBuilder::rebuild`]
//! wraps an upstream error without losing the location it already carries.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Classification of a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NotFound,
    BadRequest,
    Unauthorized,
    BusinessException,
    Timeout,
    CircuitOpen,
    Transport,
    Protocol,
    Panic,
    Internal,
}

impl ErrorKind {
    /// Default HTTP status for this kind.
    #[must_use]
    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Panic => 502,
            _ => 500,
        }
    }

    /// Stable lowercase name used in logs and metric tags.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::BusinessException => "business_exception",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Panic => "panic",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the request path an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Server,
    Client,
    Middleware,
    Codec,
    Panic,
}

/// A classified gateway failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<BoxError>,
    retryable: bool,
    origin: Origin,
    status_code: Option<u16>,
    location: Option<String>,
}

impl GatewayError {
    /// Creates an error of `kind`. The retryable flag defaults from the kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            retryable: matches!(kind, ErrorKind::Timeout | ErrorKind::Transport),
            origin: Origin::Server,
            status_code: None,
            location: None,
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Path exists but not for this verb: kind `NotFound`, status 405.
    #[must_use]
    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message).with_status(405)
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_origin(Origin::Client)
    }

    #[must_use]
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message).with_origin(Origin::Client)
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message).with_origin(Origin::Client)
    }

    /// Protocol violation. Retryable only when the attached status is 5xx.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[must_use]
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Panic, message).with_origin(Origin::Panic)
    }

    #[must_use]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.cause = Some(cause.into());
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attaches an explicit status. For protocol errors a 5xx status also
    /// marks the error retryable.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        if self.kind == ErrorKind::Protocol {
            self.retryable = status >= 500;
        }
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Explicitly attached status, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Status rendered to an HTTP caller.
    ///
    /// Client-originated failures (timeouts, open circuits, transport and
    /// protocol problems talking to a backend) surface as 500 regardless of
    /// the backend's own status; other kinds honour an attached status.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match (self.kind, self.status_code) {
            (ErrorKind::Protocol | ErrorKind::Transport, _) if self.origin == Origin::Client => 500,
            (_, Some(status)) => status,
            (kind, None) => kind.default_status(),
        }
    }

    /// Whether the failure should count against a client circuit breaker.
    ///
    /// Business exceptions and caller errors (4xx) are the backend working
    /// as intended and do not trip the breaker.
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        match self.kind {
            ErrorKind::BusinessException
            | ErrorKind::BadRequest
            | ErrorKind::Unauthorized
            | ErrorKind::NotFound
            | ErrorKind::CircuitOpen => false,
            ErrorKind::Protocol => self.status_code.is_none_or(|s| s >= 500),
            _ => true,
        }
    }

    /// Caller-facing body. The cause chain is never included.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            message: self.message.clone(),
            kind: Some(self.kind),
        }
    }

    /// Renders the message and every nested cause, outermost first.
    #[must_use]
    pub fn chain_message(&self) -> String {
        let mut out = self.to_string();
        let mut source = StdError::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

/// JSON body written to callers for a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ErrorBody {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }
}

/// Stamps module location onto errors raised by one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBuilder {
    location: String,
}

impl ErrorBuilder {
    /// `module_class` is the kind of module (`endpoint`, `client`,
    /// `middleware`); `module_name` is its configured name.
    #[must_use]
    pub fn new(module_class: &str, module_name: &str) -> Self {
        Self {
            location: format!("{module_class}::{module_name}"),
        }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Creates a located error of `kind`.
    #[must_use]
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> GatewayError {
        GatewayError::new(kind, message).with_location(self.location.clone())
    }

    /// Wraps `cause` with additional context.
    ///
    /// The new error inherits the cause's kind, origin, status, retryable
    /// flag and, if set, its location.
    #[must_use]
    pub fn rebuild(&self, cause: GatewayError, message: impl Into<String>) -> GatewayError {
        let location = cause
            .location
            .clone()
            .unwrap_or_else(|| self.location.clone());
        GatewayError {
            kind: cause.kind,
            message: message.into(),
            retryable: cause.retryable,
            origin: cause.origin,
            status_code: cause.status_code,
            location: Some(location),
            cause: Some(Box::new(cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_follow_kind() {
        assert_eq!(GatewayError::bad_request("x").http_status(), 400);
        assert_eq!(GatewayError::not_found("x").http_status(), 404);
        assert_eq!(GatewayError::panic("x").http_status(), 502);
        assert_eq!(GatewayError::internal("x").http_status(), 500);
        assert_eq!(
            GatewayError::new(ErrorKind::Unauthorized, "x").http_status(),
            401
        );
    }

    #[test]
    fn client_protocol_error_renders_as_500() {
        let err = GatewayError::protocol("unexpected status")
            .with_origin(Origin::Client)
            .with_status(404);
        assert_eq!(err.http_status(), 500);
        assert_eq!(err.status_code(), Some(404));
        assert!(!err.is_retryable());
        assert!(!err.is_system_error());
    }

    #[test]
    fn retryable_flags() {
        assert!(GatewayError::timeout("t").is_retryable());
        assert!(GatewayError::transport("t").is_retryable());
        assert!(GatewayError::protocol("p").with_status(503).is_retryable());
        assert!(!GatewayError::circuit_open("c").is_retryable());
        assert!(!GatewayError::new(ErrorKind::BusinessException, "b").is_retryable());
    }

    #[test]
    fn system_error_classification() {
        assert!(GatewayError::timeout("t").is_system_error());
        assert!(GatewayError::transport("t").is_system_error());
        assert!(GatewayError::protocol("p").with_status(502).is_system_error());
        assert!(!GatewayError::new(ErrorKind::BusinessException, "b").is_system_error());
        assert!(!GatewayError::circuit_open("c").is_system_error());
    }

    #[test]
    fn builder_stamps_location() {
        let eb = ErrorBuilder::new("endpoint", "bar");
        let err = eb.error(ErrorKind::BadRequest, "bad");
        assert_eq!(err.location(), Some("endpoint::bar"));
        assert_eq!(err.to_string(), "bad_request: bad");
    }

    #[test]
    fn rebuild_keeps_original_location_and_kind() {
        let client = ErrorBuilder::new("client", "baz");
        let endpoint = ErrorBuilder::new("endpoint", "bar");
        let inner = client
            .error(ErrorKind::Timeout, "deadline exceeded")
            .with_origin(Origin::Client);
        let outer = endpoint.rebuild(inner, "calling baz");
        assert_eq!(outer.location(), Some("client::baz"));
        assert_eq!(outer.kind(), ErrorKind::Timeout);
        assert!(outer.is_retryable());
        assert_eq!(
            outer.chain_message(),
            "timeout: calling baz: timeout: deadline exceeded"
        );
    }

    #[test]
    fn body_omits_cause() {
        let err = GatewayError::internal("boom").with_cause(std::io::Error::other("secret"));
        let json = serde_json::to_string(&err.to_body()).unwrap();
        assert_eq!(json, r#"{"message":"boom","kind":"internal"}"#);
        assert!(err.cause().is_some());
    }
}
