//! The outbound call envelope.
//!
//! [`ClientCaller::call_raw`] applies, in order: header augmentation, the
//! overall and per-attempt deadlines, the client span, and an attempt loop
//! in which every attempt passes the circuit breaker and emits its own
//! metrics. Retries happen only for retryable errors while budget remains.
//! [`ClientCaller::call`] adds typed encoding and decoding on top.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use switchyard_core::{codec, ErrorBuilder, ErrorKind, GatewayError, Headers, Origin, PayloadFormat};
use tokio::time::Instant;

use super::breaker::{CircuitBreaker, CircuitBreakerRegistry};
use super::options::{ClientDescriptor, ClientProtocol, TimeoutOptions};
use super::response::{ClientResponse, DeclaredException, UnexpectedStatus};
use super::transport::{OutboundRequest, OutboundResponse, Transport};
use crate::service::context::RequestContext;
use crate::service::metrics::{names, tags, ContextMetrics};
use crate::service::tracer::Tracer;
use crate::service::workflow::{WorkflowOutcome, WorkflowResponse};

/// Result of a typed client call.
pub type ClientOutcome<R, E> = WorkflowOutcome<R, E>;

/// One method of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMethod {
    /// Local name used in metrics, span and breaker names.
    pub short_name: String,
    /// Wire name, `Service::method`.
    pub procedure: String,
    pub http_method: String,
    pub path: String,
    pub success_statuses: Vec<u16>,
    /// Statuses at which the body is a declared exception.
    pub exception_statuses: Vec<u16>,
}

impl ClientMethod {
    #[must_use]
    pub fn http(short_name: &str, procedure: &str, http_method: &str, path: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            procedure: procedure.to_string(),
            http_method: http_method.to_ascii_uppercase(),
            path: path.to_string(),
            success_statuses: vec![200],
            exception_statuses: Vec::new(),
        }
    }

    #[must_use]
    pub fn rpc(short_name: &str, procedure: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            procedure: procedure.to_string(),
            http_method: String::new(),
            path: String::new(),
            success_statuses: vec![200],
            exception_statuses: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_success_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.success_statuses = statuses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_exception_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.exception_statuses = statuses.into_iter().collect();
        self
    }
}

/// Payload encoding used on the wire for a client protocol.
#[must_use]
pub fn payload_format(protocol: ClientProtocol) -> PayloadFormat {
    match protocol {
        ClientProtocol::Http => PayloadFormat::Json,
        ClientProtocol::FramedRpc | ClientProtocol::Grpc => PayloadFormat::MsgPack,
    }
}

/// How a single attempt ended.
enum Attempt {
    Success(OutboundResponse),
    /// Declared exception, or an undeclared status below 500.
    Application(OutboundResponse),
    Failed(GatewayError),
}

/// Calls the methods of one client.
pub struct ClientCaller {
    descriptor: Arc<ClientDescriptor>,
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    tracer: Tracer,
    errors: ErrorBuilder,
}

impl ClientCaller {
    /// Installs a breaker for every method in the descriptor's method map
    /// unless breakers are disabled for the client.
    #[must_use]
    pub fn new(
        descriptor: Arc<ClientDescriptor>,
        transport: Arc<dyn Transport>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        if !descriptor.circuit_breaker_disabled {
            for short in descriptor.method_name_map.values() {
                let name = CircuitBreakerRegistry::breaker_name(&descriptor.client_id, short);
                breakers.configure(&name, descriptor.circuit_breaker);
            }
        }
        let errors = ErrorBuilder::new("client", &descriptor.client_id);
        Self {
            descriptor,
            transport,
            breakers,
            tracer: Tracer::noop(),
            errors,
        }
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    #[must_use]
    pub fn descriptor(&self) -> &ClientDescriptor {
        &self.descriptor
    }

    fn breaker(&self, short_name: &str) -> Option<Arc<CircuitBreaker>> {
        if self.descriptor.circuit_breaker_disabled {
            return None;
        }
        let name = CircuitBreakerRegistry::breaker_name(&self.descriptor.client_id, short_name);
        Some(
            self.breakers
                .get(&name)
                .unwrap_or_else(|| self.breakers.configure(&name, self.descriptor.circuit_breaker)),
        )
    }

    fn outbound_headers(&self, ctx: &RequestContext, method: &ClientMethod, mut headers: Headers) -> Headers {
        let d = &self.descriptor;
        headers.merge_defaults(&d.default_headers);
        if let Some(key) = &d.request_uuid_header_key {
            if !ctx.request_uuid().is_empty() {
                headers.set(key.clone(), ctx.request_uuid());
            }
        }
        if d.protocol == ClientProtocol::Http {
            if let Some(key) = &d.procedure_header_key {
                headers.set(key.clone(), method.procedure.clone());
            }
        }
        headers
    }

    /// Overall budget and per-attempt budget for this call, plus the
    /// attempt cap.
    fn budgets(&self, ctx: &RequestContext, opts: &TimeoutOptions) -> (Duration, Duration, u32) {
        let client_timeout = self.descriptor.timeout;
        let mut overall = opts.overall.map_or(client_timeout, |o| o.min(client_timeout));
        if let Some(remaining) = ctx.remaining() {
            overall = overall.min(remaining);
        }
        if opts.max_attempts == 0 {
            return (overall, client_timeout.min(overall), 1);
        }
        let per_attempt = opts
            .per_attempt
            .or(self.descriptor.timeout_per_attempt)
            .unwrap_or(client_timeout)
            .min(overall);
        (overall, per_attempt, opts.max_attempts)
    }

    fn classify(&self, method: &ClientMethod, resp: OutboundResponse) -> Attempt {
        if resp.exception.is_some() || method.exception_statuses.contains(&resp.status) {
            return Attempt::Application(resp);
        }
        if method.success_statuses.contains(&resp.status) {
            return Attempt::Success(resp);
        }
        if resp.status >= 500 {
            let err = self
                .errors
                .error(ErrorKind::Protocol, format!("unexpected status {} from {}", resp.status, method.procedure))
                .with_origin(Origin::Client)
                .with_status(resp.status)
                .with_cause(UnexpectedStatus {
                    status: resp.status,
                    body: resp.body,
                });
            return Attempt::Failed(err);
        }
        Attempt::Application(resp)
    }

    /// Runs the call envelope and returns the final attempt's response.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error: `CircuitOpen` when the breaker
    /// refused admission, `Timeout` when the budget ran out or the context
    /// was cancelled, `Transport` for connection failures, and `Protocol`
    /// for an undeclared 5xx (with the raw body attached as cause).
    #[allow(clippy::too_many_lines)]
    pub async fn call_raw(
        &self,
        ctx: &RequestContext,
        method: &ClientMethod,
        headers: Headers,
        body: Bytes,
        opts: &TimeoutOptions,
    ) -> Result<ClientResponse, GatewayError> {
        let d = &self.descriptor;
        let started = Instant::now();
        let client_type = self.transport.client_type();
        let metrics: ContextMetrics = ctx.metrics().tagged([
            (tags::CLIENT_ID, d.client_id.as_str()),
            (tags::CLIENT_METHOD, method.short_name.as_str()),
            (tags::CLIENT_TYPE, client_type),
        ]);

        let mut headers = self.outbound_headers(ctx, method, headers);
        let target = d.resolve_target(&headers, ctx.inbound_headers());

        let (overall, per_attempt, max_attempts) = self.budgets(ctx, opts);
        let deadline = started + overall;

        let mut span = self.tracer.start_span(
            format!("{}.{}({})", d.client_id, method.short_name, method.procedure),
            ctx.span(),
        );
        span.context().inject(&mut headers);
        span.set_tag("client.id", d.client_id.clone());
        span.set_tag("client.type", client_type);

        let breaker = self.breaker(&method.short_name);
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Attempt::Failed(
                    self.errors
                        .error(ErrorKind::Timeout, format!("deadline exceeded before attempt {attempts}"))
                        .with_origin(Origin::Client),
                );
            }
            let mut attempt_timeout = per_attempt.min(remaining);
            if let Some(b) = &breaker {
                attempt_timeout = attempt_timeout.min(b.config().timeout);
            }

            let permit = match &breaker {
                Some(b) => match b.try_acquire() {
                    Ok(p) => Some(p),
                    Err(rejection) => {
                        break Attempt::Failed(
                            self.errors
                                .error(ErrorKind::CircuitOpen, format!("circuit breaker {}: {rejection}", b.name()))
                                .with_origin(Origin::Client),
                        );
                    }
                },
                None => None,
            };

            let request = OutboundRequest {
                procedure: method.procedure.clone(),
                http_method: method.http_method.clone(),
                path: method.path.clone(),
                headers: headers.clone(),
                body: body.clone(),
                timeout: attempt_timeout,
                base_address: target.base_address.clone(),
                service_name: target.service_name.clone(),
                routing_key: d.routing_key.clone(),
            };

            let attempt_started = Instant::now();
            let result = tokio::select! {
                r = tokio::time::timeout(attempt_timeout, self.transport.send(request)) => Some(r),
                () = ctx.cancellation().cancelled() => None,
            };
            let elapsed = attempt_started.elapsed();
            metrics.inc_counter(names::CLIENT_REQUEST, 1);
            metrics.record_timer(names::CLIENT_LATENCY, elapsed);
            metrics.record_histogram(names::CLIENT_LATENCY_HIST, elapsed);

            let attempt = match result {
                None => {
                    // Cancelled: the breaker sees neither success nor failure.
                    drop(permit);
                    break Attempt::Failed(
                        self.errors
                            .error(ErrorKind::Timeout, "request context cancelled")
                            .with_origin(Origin::Client)
                            .with_retryable(false),
                    );
                }
                Some(Err(_)) => Attempt::Failed(
                    self.errors
                        .error(ErrorKind::Timeout, format!("attempt timed out after {attempt_timeout:?}"))
                        .with_origin(Origin::Client),
                ),
                Some(Ok(Err(err))) => {
                    Attempt::Failed(err.into_gateway().with_location(self.errors.location()))
                }
                Some(Ok(Ok(resp))) => self.classify(method, resp),
            };

            if let Some(permit) = permit {
                match &attempt {
                    Attempt::Failed(err) if err.is_system_error() => permit.record_failure(),
                    _ => permit.record_success(),
                }
            }

            let Attempt::Failed(err) = &attempt else {
                break attempt;
            };
            if !err.is_retryable() || attempts >= max_attempts {
                break attempt;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break attempt;
            }
            let backoff = opts.backoff(attempts - 1).min(remaining);
            ctx.logger()
                .with_field("attempt", attempts.to_string())
                .with_field("error", err.message())
                .debug("Retrying outgoing client request");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = ctx.cancellation().cancelled() => break attempt,
            }
        };

        let elapsed = started.elapsed();
        ctx.annotate_client_call(client_type, elapsed);
        let format = payload_format(d.protocol);

        let result = match outcome {
            Attempt::Success(resp) => {
                metrics.inc_counter(names::CLIENT_SUCCESS, 1);
                Ok(resp)
            }
            Attempt::Application(resp) => {
                metrics.inc_counter(names::CLIENT_APP_ERRORS, 1);
                if resp.exception.is_none() && !method.exception_statuses.contains(&resp.status) {
                    metrics.inc_counter(names::CLIENT_ERRORS, 1);
                }
                Ok(resp)
            }
            Attempt::Failed(err) => {
                metrics.inc_counter(names::CLIENT_SYSTEM_ERRORS, 1);
                metrics.inc_counter(names::CLIENT_ERRORS, 1);
                Err(err)
            }
        };

        let status = match &result {
            Ok(resp) => resp.status.to_string(),
            Err(err) => err.http_status().to_string(),
        };
        metrics
            .tagged([(tags::STATUS, status.as_str())])
            .inc_counter(names::CLIENT_STATUS, 1);

        span.set_tag("attempts", attempts.to_string());
        span.set_tag("status", status.clone());
        if let Err(err) = &result {
            span.set_tag("error", err.kind().as_str());
        }
        span.finish();

        let logger = ctx
            .logger()
            .with_field("clientID", d.client_id.clone())
            .with_field("clientMethod", method.short_name.clone())
            .with_field("clientProcedure", method.procedure.clone())
            .with_field("clientType", client_type)
            .with_field("attempts", attempts.to_string())
            .with_field("status", status);
        match &result {
            Ok(_) => logger.debug("Finished an outgoing client request"),
            Err(err) => logger
                .with_field("error", err.chain_message())
                .warn("Finished an outgoing client request"),
        }

        result.map(|resp| ClientResponse {
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
            exception: resp.exception,
            format,
        })
    }

    /// Typed call: encodes `body`, runs [`call_raw`](Self::call_raw) and
    /// decodes the answer into a tagged outcome.
    pub async fn call<Req, Resp, E>(
        &self,
        ctx: &RequestContext,
        method: &ClientMethod,
        headers: Headers,
        body: Option<&Req>,
        opts: &TimeoutOptions,
    ) -> ClientOutcome<Resp, E>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
        E: DeclaredException,
    {
        let format = payload_format(self.descriptor.protocol);
        let encoded = match body {
            Some(body) => match codec::encode(format, body) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    return WorkflowOutcome::SystemError(
                        self.errors
                            .error(ErrorKind::Internal, format!("could not encode {} request", method.procedure))
                            .with_origin(Origin::Codec)
                            .with_cause(err),
                    );
                }
            },
            None => Bytes::new(),
        };

        let resp = match self.call_raw(ctx, method, headers, encoded, opts).await {
            Ok(resp) => resp,
            Err(err) => return WorkflowOutcome::SystemError(err),
        };

        if let Some(parsed) = E::from_response(resp.status, resp.exception.as_deref(), &resp.body, resp.format) {
            return match parsed {
                Ok(exception) => WorkflowOutcome::BusinessException {
                    exception,
                    headers: Some(resp.headers),
                },
                Err(err) => {
                    self.unmarshal_failed(ctx, method);
                    WorkflowOutcome::SystemError(
                        self.errors
                            .error(ErrorKind::Protocol, format!("could not decode {} exception", method.procedure))
                            .with_origin(Origin::Codec)
                            .with_cause(err),
                    )
                }
            };
        }

        if let Some(variant) = &resp.exception {
            return WorkflowOutcome::SystemError(
                self.errors
                    .error(
                        ErrorKind::Protocol,
                        format!("undeclared exception {variant} from {}", method.procedure),
                    )
                    .with_origin(Origin::Client),
            );
        }

        if !method.success_statuses.contains(&resp.status) {
            return WorkflowOutcome::SystemError(
                self.errors
                    .error(
                        ErrorKind::Protocol,
                        format!("unexpected status {} from {}", resp.status, method.procedure),
                    )
                    .with_origin(Origin::Client)
                    .with_cause(UnexpectedStatus {
                        status: resp.status,
                        body: resp.body,
                    }),
            );
        }

        match resp.read_and_unmarshal::<Resp>() {
            Ok(body) => WorkflowOutcome::Ok(WorkflowResponse {
                body,
                headers: Some(resp.headers),
            }),
            Err(err) => {
                self.unmarshal_failed(ctx, method);
                WorkflowOutcome::SystemError(
                    self.errors
                        .error(ErrorKind::Protocol, format!("could not decode {} response", method.procedure))
                        .with_origin(Origin::Codec)
                        .with_cause(err),
                )
            }
        }
    }

    fn unmarshal_failed(&self, ctx: &RequestContext, method: &ClientMethod) {
        ctx.metrics()
            .tagged([
                (tags::CLIENT_ID, self.descriptor.client_id.as_str()),
                (tags::CLIENT_METHOD, method.short_name.as_str()),
            ])
            .inc_counter(names::CLIENT_UNMARSHAL_ERROR, 1);
    }
}

impl std::fmt::Debug for ClientCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCaller")
            .field("client_id", &self.descriptor.client_id)
            .field("protocol", &self.descriptor.protocol)
            .field("client_type", &self.transport.client_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use switchyard_core::{ManualClock, SpanContext};

    use super::*;
    use crate::client::breaker::BreakerState;
    use crate::client::transport::TransportError;
    use crate::service::metrics::InMemoryMetrics;
    use crate::service::tracer::InMemoryReporter;
    use crate::service::workflow::BusinessException;

    type Scripted = Result<OutboundResponse, TransportError>;

    /// Replays scripted answers; repeats the last one when the script ends.
    struct StubTransport {
        script: Mutex<VecDeque<Scripted>>,
        fallback: fn() -> Scripted,
        seen: Mutex<Vec<OutboundRequest>>,
        delay: Duration,
    }

    impl StubTransport {
        fn new(fallback: fn() -> Scripted) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback,
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn then(self, answer: Scripted) -> Self {
            self.script.lock().push_back(answer);
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn seen(&self) -> Vec<OutboundRequest> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn client_type(&self) -> &'static str {
            "http"
        }

        async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError> {
            self.seen.lock().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(self.fallback)
        }
    }

    fn reply(status: u16, body: &'static str) -> Scripted {
        Ok(OutboundResponse {
            status,
            headers: [("some-res-header", "something")].into_iter().collect(),
            body: Bytes::from_static(body.as_bytes()),
            exception: None,
        })
    }

    fn ok() -> Scripted {
        reply(200, r#"{"message":"hello"}"#)
    }

    fn server_error() -> Scripted {
        reply(500, "boom")
    }

    struct Fixture {
        caller: ClientCaller,
        transport: Arc<StubTransport>,
        sink: Arc<InMemoryMetrics>,
        registry: Arc<CircuitBreakerRegistry>,
        clock: Arc<ManualClock>,
    }

    fn fixture(transport: StubTransport, configure: impl FnOnce(&mut ClientDescriptor)) -> Fixture {
        let sink = Arc::new(InMemoryMetrics::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(CircuitBreakerRegistry::new(
            clock.clone(),
            ContextMetrics::new(sink.clone()),
        ));
        let mut descriptor = ClientDescriptor::new(
            "multi",
            ClientProtocol::Http,
            "http://127.0.0.1:1",
            Duration::from_secs(1),
        )
        .with_method("Multi::helloA", "HelloA");
        descriptor.request_uuid_header_key = Some("x-request-uuid".into());
        descriptor.default_headers = [("x-client", "default"), ("x-app", "gw")].into_iter().collect();
        configure(&mut descriptor);
        let transport = Arc::new(transport);
        let caller = ClientCaller::new(Arc::new(descriptor), transport.clone(), registry.clone());
        Fixture {
            caller,
            transport,
            sink,
            registry,
            clock,
        }
    }

    fn ctx(f: &Fixture) -> RequestContext {
        RequestContext::new("uuid-1", ContextMetrics::new(f.sink.clone())).for_endpoint("bar", "helloWorld")
    }

    fn method() -> ClientMethod {
        ClientMethod::http("HelloA", "Multi::helloA", "GET", "/helloA")
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Greeting {
        message: String,
    }

    #[tokio::test(start_paused = true)]
    async fn headers_are_augmented_and_caller_wins() {
        let f = fixture(StubTransport::new(ok), |_| {});
        let caller_headers: Headers = [("x-client", "mine")].into_iter().collect();
        let resp = f
            .caller
            .call_raw(&ctx(&f), &method(), caller_headers, Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        let seen = f.transport.seen();
        assert_eq!(seen.len(), 1);
        let h = &seen[0].headers;
        assert_eq!(h.get("x-client"), Some("mine"));
        assert_eq!(h.get("x-app"), Some("gw"));
        assert_eq!(h.get("x-request-uuid"), Some("uuid-1"));
        assert_eq!(seen[0].timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn typed_call_decodes_body_and_annotates_context() {
        let f = fixture(StubTransport::new(ok), |_| {});
        let ctx = ctx(&f);
        let outcome: ClientOutcome<Greeting, crate::service::workflow::NoException> = f
            .caller
            .call::<(), _, _>(&ctx, &method(), Headers::new(), None, &TimeoutOptions::default())
            .await;
        let WorkflowOutcome::Ok(resp) = outcome else {
            panic!("expected success");
        };
        assert_eq!(resp.body, Some(Greeting { message: "hello".into() }));
        assert_eq!(resp.headers.unwrap().get("some-res-header"), Some("something"));
        assert_eq!(ctx.annotations().client_type, "http");

        assert_eq!(f.sink.counter_total(names::CLIENT_REQUEST), 1);
        assert_eq!(f.sink.counter_total(names::CLIENT_SUCCESS), 1);
        assert_eq!(f.sink.counter_total(names::CLIENT_STATUS), 1);
        assert_eq!(f.sink.named(names::CLIENT_LATENCY).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_within_budget() {
        let transport = StubTransport::new(ok).then(server_error()).then(server_error());
        let f = fixture(transport, |_| {});
        let opts = TimeoutOptions {
            overall: Some(Duration::from_millis(500)),
            per_attempt: Some(Duration::from_millis(100)),
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            scale_factor: 2.0,
        };
        let resp = f
            .caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &opts)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(f.transport.seen().len(), 3);
        assert_eq!(f.sink.counter_total(names::CLIENT_REQUEST), 3);
        assert_eq!(f.sink.counter_total(names::CLIENT_STATUS), 1);
        assert!(f.transport.seen().iter().all(|r| r.timeout <= Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_timeout_bounds_each_attempt() {
        let transport = StubTransport::new(ok).delayed(Duration::from_millis(500));
        let f = fixture(transport, |d| d.circuit_breaker.timeout = Duration::from_millis(200));
        let err = f
            .caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let seen = f.transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].timeout, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_breaker_leaves_client_timeout_alone() {
        let f = fixture(StubTransport::new(ok), |d| {
            d.circuit_breaker_disabled = true;
            d.circuit_breaker.timeout = Duration::from_millis(200);
        });
        f.caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap();
        assert_eq!(f.transport.seen()[0].timeout, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_never_exceed_the_cap() {
        let f = fixture(StubTransport::new(server_error), |_| {});
        let opts = TimeoutOptions {
            overall: Some(Duration::from_secs(1)),
            per_attempt: Some(Duration::from_millis(50)),
            max_attempts: 2,
            ..TimeoutOptions::default()
        };
        let err = f
            .caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.location(), Some("client::multi"));
        let cause = err.cause().and_then(|c| c.downcast_ref::<UnexpectedStatus>()).unwrap();
        assert_eq!(cause.body, Bytes::from_static(b"boom"));
        assert_eq!(f.transport.seen().len(), 2);
        assert_eq!(f.sink.counter_total(names::CLIENT_SYSTEM_ERRORS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_means_one_attempt_at_client_timeout() {
        let f = fixture(StubTransport::new(server_error), |d| {
            d.timeout_per_attempt = Some(Duration::from_millis(10));
        });
        let opts = TimeoutOptions {
            max_attempts: 0,
            per_attempt: Some(Duration::from_millis(10)),
            ..TimeoutOptions::default()
        };
        let _ = f
            .caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &opts)
            .await;
        let seen = f.transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].timeout, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let f = fixture(StubTransport::new(ok).delayed(Duration::from_secs(5)), |_| {});
        let err = f
            .caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(f.registry.get("multi-HelloA").unwrap().counts(), (1, 1));
    }

    #[tokio::test]
    async fn cancellation_abandons_the_call() {
        let f = fixture(StubTransport::new(ok).delayed(Duration::from_millis(200)), |_| {});
        let ctx = ctx(&f);
        ctx.cancel();
        let err = f
            .caller
            .call_raw(&ctx, &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_retryable());
        assert_eq!(f.registry.get("multi-HelloA").unwrap().counts(), (0, 0));
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_the_breaker() {
        let f = fixture(StubTransport::new(|| reply(404, "")), |_| {});
        for _ in 0..25 {
            let resp = f
                .caller
                .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
                .await
                .unwrap();
            assert_eq!(resp.status, 404);
        }
        let breaker = f.registry.get("multi-HelloA").unwrap();
        assert_eq!(breaker.counts(), (25, 0));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_then_recovers() {
        let mut transport = StubTransport::new(ok);
        for i in 0..20 {
            transport = transport.then(if i % 4 == 3 { server_error() } else { ok() });
        }
        let f = fixture(transport, |_| {});
        for _ in 0..20 {
            let _ = f
                .caller
                .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
                .await;
        }

        let err = f
            .caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(f.transport.seen().len(), 20);

        f.clock.advance(5_000);
        let breaker = f.registry.get("multi-HelloA").unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        f.caller
            .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn disabled_breaker_is_never_consulted() {
        let f = fixture(StubTransport::new(server_error), |d| d.circuit_breaker_disabled = true);
        for _ in 0..30 {
            let err = f
                .caller
                .call_raw(&ctx(&f), &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol);
        }
        assert!(f.registry.get("multi-HelloA").is_none());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct NotFound {
        reason: String,
    }

    impl BusinessException for NotFound {
        fn variant(&self) -> &'static str {
            "NotFound"
        }

        fn status_code(&self) -> u16 {
            404
        }
    }

    impl DeclaredException for NotFound {
        fn from_response(
            status: u16,
            variant: Option<&str>,
            body: &[u8],
            format: PayloadFormat,
        ) -> Option<Result<Self, switchyard_core::CodecError>> {
            (status == 404 || variant == Some("NotFound")).then(|| codec::decode(format, body))
        }
    }

    #[tokio::test]
    async fn declared_exception_is_typed() {
        let f = fixture(StubTransport::new(|| reply(404, r#"{"reason":"gone"}"#)), |_| {});
        let method = method().with_exception_statuses([404]);
        let outcome: ClientOutcome<Greeting, NotFound> = f
            .caller
            .call::<(), _, _>(&ctx(&f), &method, Headers::new(), None, &TimeoutOptions::default())
            .await;
        let WorkflowOutcome::BusinessException { exception, .. } = outcome else {
            panic!("expected business exception");
        };
        assert_eq!(exception, NotFound { reason: "gone".into() });
        assert_eq!(f.sink.counter_total(names::CLIENT_APP_ERRORS), 1);
        assert_eq!(f.sink.counter_total(names::CLIENT_ERRORS), 0);
    }

    #[tokio::test]
    async fn undeclared_status_is_a_protocol_error_with_raw_body() {
        let f = fixture(StubTransport::new(|| reply(418, "teapot")), |_| {});
        let outcome: ClientOutcome<Greeting, NotFound> = f
            .caller
            .call::<(), _, _>(&ctx(&f), &method(), Headers::new(), None, &TimeoutOptions::default())
            .await;
        let WorkflowOutcome::SystemError(err) = outcome else {
            panic!("expected system error");
        };
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_retryable());
        let cause = err.cause().and_then(|c| c.downcast_ref::<UnexpectedStatus>()).unwrap();
        assert_eq!(cause.body, Bytes::from_static(b"teapot"));
    }

    #[tokio::test]
    async fn bad_body_counts_unmarshal_error() {
        let f = fixture(StubTransport::new(|| reply(200, "{")), |_| {});
        let outcome: ClientOutcome<Greeting, NotFound> = f
            .caller
            .call::<(), _, _>(&ctx(&f), &method(), Headers::new(), None, &TimeoutOptions::default())
            .await;
        assert!(matches!(outcome, WorkflowOutcome::SystemError(_)));
        assert_eq!(f.sink.counter_total(names::CLIENT_UNMARSHAL_ERROR), 1);
    }

    #[tokio::test]
    async fn client_span_is_child_of_endpoint_span() {
        let reporter = Arc::new(InMemoryReporter::new());
        let mut f = fixture(StubTransport::new(ok), |_| {});
        f.caller = f.caller.with_tracer(Tracer::new(reporter.clone()));
        let parent = SpanContext::new_root();
        let ctx = ctx(&f).with_span(parent);
        f.caller
            .call_raw(&ctx, &method(), Headers::new(), Bytes::new(), &TimeoutOptions::default())
            .await
            .unwrap();

        let span = reporter.find("multi.HelloA(Multi::helloA)").unwrap();
        assert_eq!(span.context.trace_id, parent.trace_id);
        assert_eq!(span.context.parent_id, parent.span_id);
        let sent = SpanContext::extract(&f.transport.seen()[0].headers).unwrap();
        assert_eq!(sent.span_id, span.context.span_id);
    }
}
