//! Per-request context threaded through every layer of the request path.
//!
//! A [`RequestContext`] carries the request identity (endpoint, handler,
//! request UUID), the deadline and cancellation signal, the active span,
//! the logger and metrics scopes, and the inbound headers that outbound
//! routing decisions may consult. Cloning is cheap; clones share the
//! cancellation token and the annotation slot that clients write back into.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::{Headers, SpanContext};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::logging::ContextLogger;
use super::metrics::{ContextMetrics, InMemoryMetrics};

/// Header carrying the inbound request UUID.
pub const REQUEST_UUID_HEADER: &str = "x-request-uuid";

/// Values written back into the context by outbound calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    /// Transport kind of the most recent outbound call (`http`, `rpc`, `grpc`).
    pub client_type: String,
    /// Duration of the most recent outbound call.
    pub client_response_duration: Option<Duration>,
}

/// Request-scoped context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    endpoint_id: String,
    handler_id: String,
    request_uuid: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    span: Option<SpanContext>,
    logger: ContextLogger,
    metrics: ContextMetrics,
    inbound_headers: Arc<Headers>,
    annotations: Arc<Mutex<Annotations>>,
}

impl RequestContext {
    /// Creates a context for a newly received request.
    #[must_use]
    pub fn new(request_uuid: impl Into<String>, metrics: ContextMetrics) -> Self {
        let request_uuid = request_uuid.into();
        Self {
            endpoint_id: String::new(),
            handler_id: String::new(),
            logger: ContextLogger::new().with_field("requestUUID", request_uuid.clone()),
            request_uuid,
            deadline: None,
            cancel: CancellationToken::new(),
            span: None,
            metrics,
            inbound_headers: Arc::new(Headers::new()),
            annotations: Arc::new(Mutex::new(Annotations::default())),
        }
    }

    /// A detached context with a fresh UUID and an in-memory metrics sink.
    #[must_use]
    pub fn background() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            ContextMetrics::new(Arc::new(InMemoryMetrics::new())),
        )
    }

    /// Scopes the context to an endpoint. Sets log fields and metric tags.
    #[must_use]
    pub fn for_endpoint(mut self, endpoint_id: &str, handler_id: &str) -> Self {
        self.endpoint_id = endpoint_id.to_string();
        self.handler_id = handler_id.to_string();
        self.logger.push_field("endpointID", endpoint_id);
        self.logger.push_field("handlerID", handler_id);
        self.metrics = self.metrics.tagged([
            (super::metrics::tags::ENDPOINT_ID, endpoint_id),
            (super::metrics::tags::HANDLER_ID, handler_id),
        ]);
        self
    }

    #[must_use]
    pub fn with_inbound_headers(mut self, headers: Headers) -> Self {
        self.inbound_headers = Arc::new(headers);
        self
    }

    /// Sets the deadline, keeping an earlier one if already present. The
    /// context is cancelled when the deadline passes.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        if self.deadline.is_some_and(|d| d <= deadline) {
            return self;
        }
        self.deadline = Some(deadline);
        self.arm_deadline();
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attaches the active span and stamps its ids onto the logger.
    #[must_use]
    pub fn with_span(mut self, span: SpanContext) -> Self {
        self.logger.push_field("trace.traceId", span.trace_id_hex());
        self.logger.push_field("trace.span", format!("{:x}", span.span_id));
        self.logger
            .push_field("trace.sampled", span.is_sampled().to_string());
        self.span = Some(span);
        self
    }

    /// A context whose cancellation also fires when this one is cancelled,
    /// but which can be cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut out = self.clone();
        out.cancel = self.cancel.child_token();
        out
    }

    /// Replaces the cancellation signal, usually with a child of a
    /// connection-scoped token so a disconnect cancels the request.
    /// A deadline already set cancels the new token too.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self.arm_deadline();
        self
    }

    /// Spawns a timer that cancels the current token at the deadline. The
    /// timer exits early once the token is cancelled. Outside a tokio
    /// runtime the deadline is only advisory.
    fn arm_deadline(&self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let token = self.cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => token.cancel(),
                () = token.cancelled() => {}
            }
        });
    }

    #[must_use]
    pub fn with_log_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.logger.push_field(key, value);
        self
    }

    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    #[must_use]
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    #[must_use]
    pub fn request_uuid(&self) -> &str {
        &self.request_uuid
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` means unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn span(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    #[must_use]
    pub fn logger(&self) -> &ContextLogger {
        &self.logger
    }

    #[must_use]
    pub fn metrics(&self) -> &ContextMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn inbound_headers(&self) -> &Headers {
        &self.inbound_headers
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records the outcome of an outbound call.
    pub fn annotate_client_call(&self, client_type: &str, duration: Duration) {
        let mut guard = self.annotations.lock();
        guard.client_type = client_type.to_string();
        guard.client_response_duration = Some(duration);
    }

    #[must_use]
    pub fn annotations(&self) -> Annotations {
        self.annotations.lock().clone()
    }
}
