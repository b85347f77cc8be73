//! Deputy forwarding: relays an inbound RPC request to the host named in
//! its `x-deputy-forwarded` header and answers with that host's reply.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use switchyard_core::{ConfigError, ErrorBuilder, ErrorKind, StaticConfig};

use crate::client::transport::{FramedRpcTransport, OutboundRequest, Transport, TransportError};
use crate::service::context::RequestContext;
use crate::service::endpoint::{RequestForwarder, DEPUTY_HEADER};
use crate::service::request::ServerRequest;
use crate::service::response::ServerResponse;

/// Budgets of the one-shot deputy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeputyConfig {
    pub timeout: Duration,
    pub timeout_per_attempt: Duration,
    /// Service announced to the deputy host.
    pub service_name: String,
    pub routing_key: Option<String>,
}

impl Default for DeputyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            timeout_per_attempt: Duration::from_secs(1),
            service_name: "switchyard".to_string(),
            routing_key: None,
        }
    }
}

impl DeputyConfig {
    /// Reads `tchannel.deputy.timeout`, `tchannel.deputy.timeoutPerAttempt`
    /// (milliseconds), `tchannel.serviceName` and `tchannel.routingKey`.
    /// The per-attempt budget defaults to the overall one.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a present key has the wrong type.
    pub fn from_config(config: &StaticConfig) -> Result<Self, ConfigError> {
        let d = Self::default();
        let default_ms = i64::try_from(d.timeout.as_millis()).unwrap_or(i64::MAX);
        let timeout_ms = config.int_or("tchannel.deputy.timeout", default_ms)?;
        let per_attempt_ms = config.int_or("tchannel.deputy.timeoutPerAttempt", timeout_ms)?;
        Ok(Self {
            timeout: Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0)),
            timeout_per_attempt: Duration::from_millis(u64::try_from(per_attempt_ms).unwrap_or(0)),
            service_name: config.string_or("tchannel.serviceName", &d.service_name)?,
            routing_key: config.optional_string("tchannel.routingKey")?,
        })
    }
}

/// [`RequestForwarder`] over the framed RPC transport.
pub struct DeputyForwarder {
    config: DeputyConfig,
    transport: Arc<dyn Transport>,
    errors: ErrorBuilder,
}

impl DeputyForwarder {
    #[must_use]
    pub fn new(config: DeputyConfig) -> Self {
        Self::with_transport(config, Arc::new(FramedRpcTransport::new()))
    }

    #[must_use]
    pub fn with_transport(config: DeputyConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            errors: ErrorBuilder::new("deputy", "forward"),
        }
    }

    /// Budget of the single attempt: the configured per-attempt timeout,
    /// capped by the overall timeout and the caller's remaining deadline.
    fn attempt_budget(&self, ctx: &RequestContext) -> Duration {
        let overall = ctx
            .remaining()
            .map_or(self.config.timeout, |left| left.min(self.config.timeout));
        self.config.timeout_per_attempt.min(overall)
    }
}

#[async_trait]
impl RequestForwarder for DeputyForwarder {
    async fn forward(&self, ctx: &RequestContext, target: &str, req: &ServerRequest, res: &mut ServerResponse) {
        let mut headers = req.headers().clone();
        headers.remove(DEPUTY_HEADER);
        let budget = self.attempt_budget(ctx);
        let outbound = OutboundRequest {
            procedure: req.method().to_string(),
            http_method: String::new(),
            path: String::new(),
            headers,
            body: req.raw_body().clone(),
            timeout: budget,
            base_address: target.to_string(),
            service_name: self.config.service_name.clone(),
            routing_key: self.config.routing_key.clone(),
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => {
                Err(self.errors.error(ErrorKind::Timeout, "request cancelled while waiting for deputy"))
            }
            sent = tokio::time::timeout(budget, self.transport.send(outbound)) => match sent {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(err)) => Err(err.into_gateway()),
                Err(_) => Err(TransportError::Timeout(budget).into_gateway()),
            },
        };
        ctx.annotate_client_call(self.transport.client_type(), started.elapsed());

        match result {
            Ok(resp) => match resp.exception {
                Some(variant) => res.write_raw_exception(&variant, resp.status, Some(resp.headers), resp.body),
                None => res.write_bytes(resp.status, Some(resp.headers), resp.body, None),
            },
            Err(err) => {
                ctx.logger()
                    .with_field("deputy", target)
                    .with_field("error", err.chain_message())
                    .warn("Deputy request failed");
                res.send_gateway_error(self.errors.rebuild(err, format!("deputy {target} failed")));
            }
        }
    }
}

impl std::fmt::Debug for DeputyForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeputyForwarder")
            .field("config", &self.config)
            .field("client_type", &self.transport.client_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;
    use switchyard_core::{GatewayError, Headers};

    use super::*;
    use crate::client::transport::OutboundResponse;
    use crate::rpc::frame::RpcErrorCode;
    use crate::service::request::Protocol;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<OutboundRequest>>,
        reply: Mutex<Option<Result<OutboundResponse, TransportError>>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for Recording {
        fn client_type(&self) -> &'static str {
            "rpc"
        }

        async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse, TransportError> {
            self.seen.lock().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.reply
                .lock()
                .take()
                .unwrap_or_else(|| Err(TransportError::Protocol("no scripted reply".into())))
        }
    }

    fn inbound() -> ServerRequest {
        let headers: Headers = [(DEPUTY_HEADER, "10.0.0.7:4040"), ("x-uuid", "u-1")].into_iter().collect();
        ServerRequest::rpc("Bounce::bounce", headers, Bytes::from_static(b"payload"))
    }

    fn ok(body: &'static [u8], exception: Option<&str>) -> Result<OutboundResponse, TransportError> {
        Ok(OutboundResponse {
            status: 200,
            headers: [("x-from", "deputy")].into_iter().collect(),
            body: Bytes::from_static(body),
            exception: exception.map(str::to_string),
        })
    }

    #[test]
    fn config_reads_deputy_budgets() {
        let store = StaticConfig::from_pairs([
            ("tchannel.deputy.timeout", json!(300)),
            ("tchannel.serviceName", json!("bounce")),
        ]);
        let config = DeputyConfig::from_config(&store).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(300));
        assert_eq!(config.timeout_per_attempt, Duration::from_millis(300));
        assert_eq!(config.service_name, "bounce");
        assert_eq!(config.routing_key, None);
    }

    #[tokio::test]
    async fn forwards_request_without_deputy_header() {
        let transport = Arc::new(Recording::default());
        *transport.reply.lock() = Some(ok(b"relayed", None));
        let forwarder = DeputyForwarder::with_transport(DeputyConfig::default(), transport.clone());

        let ctx = RequestContext::background();
        let mut res = ServerResponse::new(Protocol::Rpc);
        forwarder.forward(&ctx, "10.0.0.7:4040", &inbound(), &mut res).await;

        assert_eq!(res.status(), Some(200));
        assert_eq!(res.body(), b"relayed");
        assert_eq!(res.headers().get("x-from"), Some("deputy"));
        assert_eq!(ctx.annotations().client_type, "rpc");

        let seen = transport.seen.lock();
        assert_eq!(seen[0].base_address, "10.0.0.7:4040");
        assert_eq!(seen[0].procedure, "Bounce::bounce");
        assert_eq!(&seen[0].body[..], b"payload");
        assert!(!seen[0].headers.contains_key(DEPUTY_HEADER));
        assert_eq!(seen[0].headers.get("x-uuid"), Some("u-1"));
    }

    #[tokio::test]
    async fn relays_declared_exceptions() {
        let transport = Arc::new(Recording::default());
        *transport.reply.lock() = Some(ok(b"\x80", Some("NotFound")));
        let forwarder = DeputyForwarder::with_transport(DeputyConfig::default(), transport);

        let mut res = ServerResponse::new(Protocol::Rpc);
        forwarder
            .forward(&RequestContext::background(), "h:1", &inbound(), &mut res)
            .await;
        assert_eq!(res.exception(), Some("NotFound"));
        assert_eq!(res.body(), b"\x80");
    }

    #[tokio::test]
    async fn remote_failure_becomes_an_error_response() {
        let transport = Arc::new(Recording::default());
        *transport.reply.lock() = Some(Err(TransportError::Remote {
            code: RpcErrorCode::Busy,
            message: "overloaded".into(),
        }));
        let forwarder = DeputyForwarder::with_transport(DeputyConfig::default(), transport);

        let mut res = ServerResponse::new(Protocol::Rpc);
        forwarder
            .forward(&RequestContext::background(), "h:1", &inbound(), &mut res)
            .await;
        let err = res.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.location(), Some("deputy::forward"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_deputy_times_out_within_budget() {
        let transport = Arc::new(Recording {
            delay: Some(Duration::from_secs(5)),
            ..Recording::default()
        });
        *transport.reply.lock() = Some(ok(b"late", None));
        let config = DeputyConfig {
            timeout: Duration::from_millis(200),
            timeout_per_attempt: Duration::from_millis(100),
            ..DeputyConfig::default()
        };
        let forwarder = DeputyForwarder::with_transport(config, transport.clone());

        let mut res = ServerResponse::new(Protocol::Rpc);
        forwarder
            .forward(&RequestContext::background(), "h:1", &inbound(), &mut res)
            .await;
        assert_eq!(res.error().map(GatewayError::kind), Some(ErrorKind::Timeout));
        assert_eq!(transport.seen.lock()[0].timeout, Duration::from_millis(100));
    }
}
