//! Contract between an endpoint and user business logic.
//!
//! A [`Workflow`] maps a typed request plus headers to a tagged
//! [`WorkflowOutcome`]. It never touches the transport: [`WorkflowHandler`]
//! adapts it into a stack [`Terminal`], decoding the body, checking the
//! header contracts and writing the wire response for each outcome.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use switchyard_core::{GatewayError, Headers, Origin};

use super::context::RequestContext;
use super::request::ServerRequest;
use super::response::ServerResponse;
use super::stack::Terminal;

/// A declared, typed error variant of an endpoint or client method.
pub trait BusinessException: Serialize + Send + Sync + 'static {
    /// Variant name as declared in the service definition.
    fn variant(&self) -> &'static str;

    /// HTTP status used when the variant is returned over HTTP.
    fn status_code(&self) -> u16;
}

/// For methods that declare no exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoException {}

impl BusinessException for NoException {
    fn variant(&self) -> &'static str {
        match *self {}
    }

    fn status_code(&self) -> u16 {
        match *self {}
    }
}

/// Successful workflow result.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResponse<R> {
    pub body: Option<R>,
    pub headers: Option<Headers>,
}

impl<R> WorkflowResponse<R> {
    #[must_use]
    pub fn new(body: R) -> Self {
        Self {
            body: Some(body),
            headers: Some(Headers::new()),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Clears the header container, as opposed to leaving it empty.
    #[must_use]
    pub fn without_headers(mut self) -> Self {
        self.headers = None;
        self
    }
}

/// Tagged result of a workflow or client call.
#[derive(Debug)]
pub enum WorkflowOutcome<R, E> {
    Ok(WorkflowResponse<R>),
    BusinessException {
        exception: E,
        headers: Option<Headers>,
    },
    SystemError(GatewayError),
}

/// User business logic behind an endpoint.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + Sync;
    type Response: Serialize + Send + Sync;
    type Exception: BusinessException;

    async fn handle(
        &self,
        ctx: &RequestContext,
        headers: &Headers,
        request: Option<Self::Request>,
    ) -> WorkflowOutcome<Self::Response, Self::Exception>;
}

/// Copies the named inbound headers into a new container for an outbound
/// call. Headers not listed are dropped.
#[must_use]
pub fn propagate_headers<S: AsRef<str>>(inbound: &Headers, allowed: &[S]) -> Headers {
    let mut out = Headers::new();
    for name in allowed {
        for value in inbound.get_all(name.as_ref()) {
            out.add(name.as_ref(), value.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// WorkflowHandler
// ---------------------------------------------------------------------------

/// Adapts a [`Workflow`] into the terminal of an execution stack.
pub struct WorkflowHandler<W: Workflow> {
    workflow: Arc<W>,
    success_status: u16,
    expects_body: bool,
    required_request_headers: Vec<String>,
    required_response_headers: Vec<String>,
}

impl<W: Workflow> WorkflowHandler<W> {
    #[must_use]
    pub fn new(workflow: W) -> Self {
        Self {
            workflow: Arc::new(workflow),
            success_status: 200,
            expects_body: true,
            required_request_headers: Vec::new(),
            required_response_headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn success_status(mut self, status: u16) -> Self {
        self.success_status = status;
        self
    }

    /// Skip body decoding; the workflow receives `None`.
    #[must_use]
    pub fn without_body(mut self) -> Self {
        self.expects_body = false;
        self
    }

    #[must_use]
    pub fn required_request_headers<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.required_request_headers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Headers the workflow must return on success. Declaring any makes a
    /// missing header container a protocol error.
    #[must_use]
    pub fn required_response_headers<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.required_response_headers = names.into_iter().map(Into::into).collect();
        self
    }

    fn check_response_headers(&self, headers: Option<&Headers>) -> Result<(), GatewayError> {
        if self.required_response_headers.is_empty() {
            return Ok(());
        }
        let Some(headers) = headers else {
            return Err(GatewayError::protocol("Workflow returned no response headers")
                .with_origin(Origin::Server));
        };
        match headers.first_missing(&self.required_response_headers) {
            None => Ok(()),
            Some(missing) => Err(GatewayError::protocol(format!(
                "Missing mandatory response header: {missing}"
            ))
            .with_origin(Origin::Server)),
        }
    }
}

#[async_trait]
impl<W: Workflow> Terminal for WorkflowHandler<W> {
    async fn handle(&self, ctx: &RequestContext, req: &mut ServerRequest, res: &mut ServerResponse) {
        if !req.check_headers(&self.required_request_headers, res) {
            return;
        }

        // GET and HEAD without a payload reach the workflow as `None`.
        let bodiless_read = matches!(req.method(), "GET" | "HEAD") && req.raw_body().is_empty();
        let body = if self.expects_body && !bodiless_read {
            match req.read_and_unmarshal::<W::Request>(res) {
                Some(body) => Some(body),
                None => return,
            }
        } else {
            None
        };

        match self.workflow.handle(ctx, req.headers(), body).await {
            WorkflowOutcome::Ok(response) => {
                if let Err(err) = self.check_response_headers(response.headers.as_ref()) {
                    ctx.logger().warn(err.message());
                    res.send_gateway_error(err);
                    return;
                }
                match &response.body {
                    Some(body) => res.write_payload(self.success_status, response.headers, body),
                    None => res.write_bytes(self.success_status, response.headers, bytes::Bytes::new(), None),
                }
            }
            WorkflowOutcome::BusinessException { exception, headers } => {
                res.write_exception(exception.variant(), exception.status_code(), headers, &exception);
            }
            WorkflowOutcome::SystemError(err) => {
                ctx.logger().warn(&format!("Workflow failed: {}", err.chain_message()));
                res.send_gateway_error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::Deserialize;

    use super::*;
    use crate::service::request::Protocol;

    #[derive(Debug, Deserialize)]
    struct Req {
        name: String,
    }

    #[derive(Debug, Serialize)]
    struct Resp {
        greeting: String,
    }

    #[derive(Debug, Serialize)]
    struct Forbidden {
        reason: String,
    }

    impl BusinessException for Forbidden {
        fn variant(&self) -> &'static str {
            "Forbidden"
        }

        fn status_code(&self) -> u16 {
            403
        }
    }

    struct Greeter;

    #[async_trait]
    impl Workflow for Greeter {
        type Request = Req;
        type Response = Resp;
        type Exception = Forbidden;

        async fn handle(
            &self,
            _ctx: &RequestContext,
            headers: &Headers,
            request: Option<Req>,
        ) -> WorkflowOutcome<Resp, Forbidden> {
            let Some(req) = request else {
                let mut out = Headers::new();
                out.set("x-greeted", "stranger");
                return WorkflowOutcome::Ok(
                    WorkflowResponse::new(Resp { greeting: "hi stranger".into() }).with_headers(out),
                );
            };
            if req.name == "mallory" {
                return WorkflowOutcome::BusinessException {
                    exception: Forbidden { reason: "no".into() },
                    headers: None,
                };
            }
            let mut out = Headers::new();
            if headers.get("x-nil-response-header") != Some("true") {
                out.set("x-greeted", req.name.clone());
                return WorkflowOutcome::Ok(
                    WorkflowResponse::new(Resp { greeting: format!("hi {}", req.name) })
                        .with_headers(out),
                );
            }
            WorkflowOutcome::Ok(WorkflowResponse::new(Resp { greeting: String::new() }).without_headers())
        }
    }

    async fn call(handler: &WorkflowHandler<Greeter>, headers: Headers, body: &'static str) -> ServerResponse {
        call_with(handler, "POST", headers, body).await
    }

    async fn call_with(
        handler: &WorkflowHandler<Greeter>,
        method: &str,
        headers: Headers,
        body: &'static str,
    ) -> ServerResponse {
        let ctx = RequestContext::background();
        let mut req = ServerRequest::http(method, "/greet".parse().unwrap(), headers, Bytes::from_static(body.as_bytes()));
        let mut res = ServerResponse::new(Protocol::Http);
        handler.handle(&ctx, &mut req, &mut res).await;
        res
    }

    #[tokio::test]
    async fn success_writes_body_and_headers() {
        let handler = WorkflowHandler::new(Greeter).required_response_headers(["x-greeted"]);
        let res = call(&handler, Headers::new(), r#"{"name":"bob"}"#).await;
        assert_eq!(res.status(), Some(200));
        assert_eq!(res.headers().get("x-greeted"), Some("bob"));
        assert_eq!(res.body(), br#"{"greeting":"hi bob"}"#);
    }

    #[tokio::test]
    async fn missing_response_headers_is_unsuccessful() {
        let handler = WorkflowHandler::new(Greeter).required_response_headers(["x-greeted"]);
        let headers: Headers = [("x-nil-response-header", "true")].into_iter().collect();
        let res = call(&handler, headers, r#"{"name":"bob"}"#).await;
        assert_eq!(res.status(), Some(500));
        assert_eq!(
            res.error().map(GatewayError::kind),
            Some(switchyard_core::ErrorKind::Protocol)
        );
    }

    #[tokio::test]
    async fn business_exception_uses_declared_status() {
        let handler = WorkflowHandler::new(Greeter);
        let res = call(&handler, Headers::new(), r#"{"name":"mallory"}"#).await;
        assert_eq!(res.status(), Some(403));
        assert_eq!(res.exception(), Some("Forbidden"));
    }

    #[tokio::test]
    async fn bad_body_never_reaches_workflow() {
        let handler = WorkflowHandler::new(Greeter);
        let res = call(&handler, Headers::new(), "nope").await;
        assert_eq!(res.status(), Some(400));
    }

    #[tokio::test]
    async fn bodiless_get_and_head_reach_workflow_without_request() {
        let handler = WorkflowHandler::new(Greeter);
        for method in ["GET", "HEAD"] {
            let res = call_with(&handler, method, Headers::new(), "").await;
            assert_eq!(res.status(), Some(200), "{method}");
            assert_eq!(res.body(), br#"{"greeting":"hi stranger"}"#);
        }
    }

    #[tokio::test]
    async fn get_with_payload_is_still_decoded() {
        let handler = WorkflowHandler::new(Greeter);
        let res = call_with(&handler, "GET", Headers::new(), r#"{"name":"bob"}"#).await;
        assert_eq!(res.status(), Some(200));
        assert_eq!(res.headers().get("x-greeted"), Some("bob"));

        let res = call_with(&handler, "GET", Headers::new(), "nope").await;
        assert_eq!(res.status(), Some(400));
    }

    #[tokio::test]
    async fn empty_post_body_is_still_rejected() {
        let handler = WorkflowHandler::new(Greeter);
        let res = call(&handler, Headers::new(), "").await;
        assert_eq!(res.status(), Some(400));
    }

    #[tokio::test]
    async fn missing_request_header_is_rejected() {
        let handler = WorkflowHandler::new(Greeter).required_request_headers(["x-uuid"]);
        let res = call(&handler, Headers::new(), r#"{"name":"bob"}"#).await;
        assert_eq!(res.status(), Some(400));
    }

    #[test]
    fn propagate_keeps_only_allowed() {
        let inbound: Headers = [("x-token", "t"), ("x-uuid", "u")].into_iter().collect();
        let out = propagate_headers(&inbound, &["x-uuid"]);
        assert_eq!(out.get("x-uuid"), Some("u"));
        assert!(!out.contains_key("x-token"));
    }
}
