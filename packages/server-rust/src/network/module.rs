//! Inbound HTTP listener with a deferred startup lifecycle.
//!
//! `new()` wires the listener to the shared router and shutdown
//! controller, `start()` binds the TCP listener, and `serve()` accepts
//! connections until the shutdown future resolves. Endpoints may still be
//! registered on the router between `start()` and `serve()`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{dispatch_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::metrics::{tags, ContextMetrics};
use crate::service::request::Protocol;
use crate::service::router::Router;

pub const LIVENESS_PATH: &str = "/health/live";
pub const READINESS_PATH: &str = "/health/ready";

pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    router: Arc<Router>,
    metrics: ContextMetrics,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        router: Arc<Router>,
        metrics: ContextMetrics,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            config,
            listener: None,
            router,
            metrics: metrics.tagged([(tags::PROTOCOL, Protocol::Http.as_str())]),
            shutdown,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router: the two probes, then a fallback that
    /// hands every other request to the gateway router.
    pub fn build_router(&self) -> axum::Router {
        let state = AppState {
            router: Arc::clone(&self.router),
            metrics: self.metrics.clone(),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
        };

        axum::Router::new()
            .route(LIVENESS_PATH, get(liveness_handler))
            .route(READINESS_PATH, get(readiness_handler))
            .fallback(dispatch_handler)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener. Returns the bound address, which carries the
    /// OS-assigned port when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(address = %local, service = %self.config.service_name, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Serves until `shutdown` resolves, then waits for in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// hits a fatal I/O error.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        self.shutdown.set_ready();
        info!("Serving HTTP connections");
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        self.shutdown.trigger_shutdown();
        if self.shutdown.drain_listener(Protocol::Http, self.config.drain_timeout).await {
            info!("HTTP listener drained");
        } else {
            warn!(
                in_flight = self.shutdown.listener_in_flight(Protocol::Http),
                "Drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for NetworkModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkModule")
            .field("config", &self.config)
            .field("bound", &self.listener.is_some())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
