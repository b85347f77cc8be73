//! Endpoint: the recovery and instrumentation boundary around one stack.
//!
//! [`Endpoint::handle`] opens the endpoint span, runs the execution stack
//! under `catch_unwind`, guarantees exactly one committed response, and
//! emits the endpoint metric families. No panic raised by a node or a
//! workflow escapes this function.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use switchyard_core::{ErrorBuilder, ErrorKind, Origin, SpanContext};

use super::context::RequestContext;
use super::metrics::{dimension_tags, names, tags};
use super::request::{Protocol, ServerRequest};
use super::response::ServerResponse;
use super::stack::ExecutionStack;
use super::tracer::Tracer;

/// Header naming an alternate host that should serve this request.
pub const DEPUTY_HEADER: &str = "x-deputy-forwarded";

/// Identity and address of a registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_id: String,
    pub handler_id: String,
    pub protocol: Protocol,
    /// HTTP verb, or the procedure for RPC.
    pub method: String,
    /// Path template for HTTP (`/users/:id`), procedure for RPC.
    pub address: String,
}

impl EndpointDescriptor {
    #[must_use]
    pub fn http(endpoint_id: &str, handler_id: &str, method: &str, path: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            handler_id: handler_id.to_string(),
            protocol: Protocol::Http,
            method: method.to_ascii_uppercase(),
            address: path.to_string(),
        }
    }

    #[must_use]
    pub fn rpc(endpoint_id: &str, handler_id: &str, procedure: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            handler_id: handler_id.to_string(),
            protocol: Protocol::Rpc,
            method: procedure.to_string(),
            address: procedure.to_string(),
        }
    }

    /// Span operation name: `<endpoint_id>.<handler_id>`.
    #[must_use]
    pub fn span_name(&self) -> String {
        format!("{}.{}", self.endpoint_id, self.handler_id)
    }
}

/// Sends a request to another host and writes that host's answer.
#[async_trait]
pub trait RequestForwarder: Send + Sync + 'static {
    async fn forward(
        &self,
        ctx: &RequestContext,
        target: &str,
        req: &ServerRequest,
        res: &mut ServerResponse,
    );
}

/// A registered handler bound to one protocol address.
pub struct Endpoint {
    descriptor: EndpointDescriptor,
    stack: ExecutionStack,
    tracer: Tracer,
    forwarder: Option<Arc<dyn RequestForwarder>>,
    errors: ErrorBuilder,
}

impl Endpoint {
    #[must_use]
    pub fn new(descriptor: EndpointDescriptor, stack: ExecutionStack) -> Self {
        let errors = ErrorBuilder::new("endpoint", &descriptor.endpoint_id);
        Self {
            descriptor,
            stack,
            tracer: Tracer::noop(),
            forwarder: None,
            errors,
        }
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Enables deputy forwarding for RPC requests.
    #[must_use]
    pub fn with_forwarder(mut self, forwarder: Arc<dyn RequestForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    #[must_use]
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    fn deputy_target<'a>(&self, req: &'a ServerRequest) -> Option<&'a str> {
        if self.descriptor.protocol != Protocol::Rpc {
            return None;
        }
        req.headers()
            .get(DEPUTY_HEADER)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Handles one request and returns its committed response.
    pub async fn handle(&self, ctx: RequestContext, mut req: ServerRequest) -> ServerResponse {
        let d = &self.descriptor;
        let ctx = ctx
            .for_endpoint(&d.endpoint_id, &d.handler_id)
            .with_inbound_headers(req.headers().clone());
        let scope = ctx.metrics().tagged(dimension_tags(req.headers()));
        scope.inc_counter(names::ENDPOINT_REQUEST, 1);

        let parent = SpanContext::extract(req.headers());
        let mut span = self.tracer.start_span(d.span_name(), parent.as_ref());
        let ctx = ctx.with_span(span.context());

        let mut res = ServerResponse::new(d.protocol);

        let deputy = self.deputy_target(&req).map(str::to_string);
        let run = async {
            match (deputy.as_deref(), self.forwarder.as_ref()) {
                (Some(target), Some(forwarder)) => {
                    ctx.logger()
                        .with_field("deputy", target)
                        .debug("Forwarding request to deputy");
                    forwarder.forward(&ctx, target, &req, &mut res).await;
                }
                _ => self.stack.run(&ctx, &mut req, &mut res).await,
            }
        };

        if let Err(payload) = AssertUnwindSafe(run).catch_unwind().await {
            let message = panic_message(payload.as_ref());
            let backtrace = Backtrace::force_capture();
            tracing::error!(
                endpoint_id = %d.endpoint_id,
                handler_id = %d.handler_id,
                request_uuid = %ctx.request_uuid(),
                panic = %message,
                backtrace = %backtrace,
                "Endpoint failure: panic"
            );
            scope.inc_counter(names::ENDPOINT_PANIC, 1);
            res = ServerResponse::new(d.protocol);
            res.send_gateway_error(
                self.errors
                    .error(ErrorKind::Panic, "Unexpected workflow panic, recovered at endpoint")
                    .with_origin(Origin::Panic),
            );
        }

        if !res.is_committed() {
            res.send_gateway_error(self.errors.error(ErrorKind::Internal, "Endpoint produced no response"));
        }

        let status = res.status().unwrap_or(500);
        let latency = req.start_time().elapsed();
        let status_tag = status.to_string();
        let client_type = ctx.annotations().client_type;

        let with_status = scope.tagged([(tags::STATUS, status_tag.as_str())]);
        with_status.record_timer(names::ENDPOINT_LATENCY, latency);
        with_status.record_histogram(names::ENDPOINT_LATENCY_HIST, latency);
        with_status
            .tagged([(tags::CLIENT_TYPE, client_type.as_str())])
            .inc_counter(names::ENDPOINT_STATUS, 1);

        let outcome = if res.exception().is_some() || (400..500).contains(&status) {
            names::ENDPOINT_APP_ERRORS
        } else if status >= 500 {
            names::ENDPOINT_SYSTEM_ERRORS
        } else {
            names::ENDPOINT_SUCCESS
        };
        scope.inc_counter(outcome, 1);

        span.set_tag("status", status_tag);
        span.finish();

        tracing::info!(
            endpoint_id = %d.endpoint_id,
            handler_id = %d.handler_id,
            request_uuid = %ctx.request_uuid(),
            method = %req.method(),
            address = %req.address(),
            status,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            client_type = %client_type,
            "Finished an incoming server request"
        );

        res
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("descriptor", &self.descriptor)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shared handle to an endpoint, as stored by the router.
pub type EndpointRef = Arc<Endpoint>;
