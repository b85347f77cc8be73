//! Framed RPC listener with a deferred startup lifecycle.
//!
//! `new()` wires the server to the shared router and shutdown controller,
//! `start()` binds the TCP listener, and `serve()` accepts connections
//! until the shutdown future resolves. Every connection gets a read loop,
//! a write task draining its bounded outbound channel, and one spawned
//! task per request frame, so responses may leave out of order and are
//! matched to their requests by frame id.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use switchyard_core::Headers;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{ConnectionHandle, ConnectionRegistry, OutboundFrame};
use super::frame::{self, RpcErrorCode, RpcRequestFrame, RpcResponseFrame, RpcStatus};
use crate::network::config::{ConnectionConfig, RpcConfig};
use crate::network::shutdown::ShutdownController;
use crate::service::context::{RequestContext, REQUEST_UUID_HEADER};
use crate::service::metrics::{tags, ContextMetrics};
use crate::service::request::{Protocol, ServerRequest};
use crate::service::router::Router;

/// State shared by every connection task.
struct Shared {
    router: Arc<Router>,
    metrics: ContextMetrics,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    connection: ConnectionConfig,
}

pub struct RpcServer {
    config: RpcConfig,
    listener: Option<TcpListener>,
    router: Arc<Router>,
    metrics: ContextMetrics,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl RpcServer {
    /// Creates the server without binding any port.
    #[must_use]
    pub fn new(
        config: RpcConfig,
        router: Arc<Router>,
        metrics: ContextMetrics,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            config,
            listener: None,
            router,
            metrics: metrics.tagged([(tags::PROTOCOL, Protocol::Rpc.as_str())]),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown,
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Binds the listener. Returns the bound address, which carries the
    /// OS-assigned port when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(
            service = %self.config.service_name,
            process = %self.config.process_name,
            address = %local,
            "RPC listener bound"
        );
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accepts connections until `shutdown` resolves, then waits for
    /// in-flight requests and closes every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let shared = Arc::new(Shared {
            router: self.router,
            metrics: self.metrics,
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            connection: self.config.connection.clone(),
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(Arc::clone(&shared), stream, peer));
                    }
                    Err(err) => warn!(error = %err, "Failed to accept RPC connection"),
                },
            }
        }
        drop(listener);

        self.shutdown.trigger_shutdown();
        if !self.shutdown.drain_listener(Protocol::Rpc, self.config.drain_timeout).await {
            warn!(
                in_flight = self.shutdown.listener_in_flight(Protocol::Rpc),
                "Drain timeout expired with RPC requests in flight"
            );
        }

        let handles = self.registry.drain_all();
        if !handles.is_empty() {
            info!(connections = handles.len(), "Closing RPC connections");
        }
        for handle in &handles {
            let _ = handle.try_send(OutboundFrame::Close);
            handle.disconnect();
        }
        Ok(())
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .field("bound", &self.listener.is_some())
            .field("connections", &self.registry.count())
            .finish_non_exhaustive()
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, %peer, "Could not set TCP_NODELAY");
    }
    let (handle, mut rx) = shared.registry.register(peer, &shared.connection);
    debug!(connection = handle.id.0, %peer, "RPC connection opened");

    let (mut sink, mut frames) = Framed::new(stream, frame::codec()).split();
    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                OutboundFrame::Frame(bytes) => {
                    if let Err(err) = sink.send(bytes).await {
                        debug!(error = %err, "RPC write failed");
                        break;
                    }
                }
                OutboundFrame::Close => break,
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            () = handle.cancellation().cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(raw)) => dispatch_frame(&shared, &handle, &raw),
                Some(Err(err)) => {
                    warn!(connection = handle.id.0, error = %err, "RPC read failed");
                    break;
                }
                None => break,
            },
        }
    }

    handle.disconnect();
    shared.registry.remove(handle.id);
    debug!(
        connection = handle.id.0,
        requests = handle.request_count(),
        "RPC connection closed"
    );
    drop(handle);
    let _ = writer.await;
}

fn dispatch_frame(shared: &Arc<Shared>, handle: &Arc<ConnectionHandle>, raw: &[u8]) {
    let request: RpcRequestFrame = match frame::decode_frame(raw) {
        Ok(request) => request,
        Err(err) => {
            warn!(connection = handle.id.0, error = %err, "Undecodable RPC request frame");
            let reply = RpcResponseFrame::system_error(0, RpcErrorCode::BadRequest, "malformed request frame");
            if let Ok(bytes) = frame::encode_frame(&reply) {
                let _ = handle.try_send(OutboundFrame::Frame(bytes));
            }
            return;
        }
    };
    handle.record_request();

    let span = tracing::info_span!(
        "rpc_request",
        connection = handle.id.0,
        id = request.id,
        procedure = %request.procedure
    );
    let guard = shared.shutdown.in_flight_guard(Protocol::Rpc);
    let shared = Arc::clone(shared);
    let handle = Arc::clone(handle);
    tokio::spawn(
        async move {
            let _guard = guard;
            let reply = process_request(&shared.router, &shared.metrics, handle.cancellation(), request).await;
            match frame::encode_frame(&reply) {
                Ok(bytes) => {
                    if let Err(err) = handle
                        .send_timeout(OutboundFrame::Frame(bytes), shared.connection.send_timeout)
                        .await
                    {
                        warn!(error = %err, "Dropped RPC response");
                    }
                }
                Err(err) => error!(error = %err, "Could not encode RPC response frame"),
            }
        }
        .instrument(span),
    );
}

/// Runs one request frame through the router and renders the reply frame.
///
/// `connection` is the connection's cancellation token; the request
/// context derives a child from it so a disconnect cancels the request.
/// A non-zero `ttl_ms` becomes the context deadline and cancels the
/// context when it expires.
pub async fn process_request(
    router: &Router,
    metrics: &ContextMetrics,
    connection: &CancellationToken,
    request: RpcRequestFrame,
) -> RpcResponseFrame {
    let id = request.id;
    let headers: Headers = request.headers.into();
    let uuid = headers
        .get(REQUEST_UUID_HEADER)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    let token = connection.child_token();
    // Stops the deadline timer once the reply is rendered.
    let _done = token.clone().drop_guard();
    let mut ctx = RequestContext::new(uuid, metrics.clone()).with_cancellation(token);
    if request.ttl_ms > 0 {
        ctx = ctx.with_timeout(Duration::from_millis(request.ttl_ms));
    }

    let mut req = ServerRequest::rpc(request.procedure, headers, Bytes::from(request.payload));
    let endpoint = match router.dispatch(&mut req) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            debug!(procedure = %req.method(), "No endpoint for RPC procedure");
            return RpcResponseFrame::system_error(id, RpcErrorCode::BadRequest, err.message());
        }
    };

    let mut res = endpoint.handle(ctx, req).await;
    let Some(flushed) = res.flush() else {
        return RpcResponseFrame::system_error(id, RpcErrorCode::Unexpected, "response already flushed");
    };
    let headers = frame::frame_headers(&flushed.headers);

    match (flushed.exception, flushed.error_message) {
        (Some(variant), _) => RpcResponseFrame {
            id,
            status: RpcStatus::ApplicationError { variant },
            headers,
            payload: flushed.body.to_vec(),
        },
        (None, Some(message)) => RpcResponseFrame {
            id,
            status: RpcStatus::SystemError {
                code: RpcErrorCode::from_status(flushed.status),
                message,
            },
            headers,
            payload: Vec::new(),
        },
        (None, None) => RpcResponseFrame {
            id,
            status: RpcStatus::Success,
            headers,
            payload: flushed.body.to_vec(),
        },
    }
}
