//! Typed gateway assembly.
//!
//! [`GatewayBuilder`] constructs components in dependency order: the
//! shared collaborators (metrics scope, tracer, clock, breaker registry)
//! first, then clients, then the endpoints that use them, and finally the
//! listeners in [`GatewayBuilder::build`]. Every wiring failure is an
//! error returned at startup; nothing is resolved lazily on the request
//! path.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use switchyard_core::{ClockSource, StaticConfig, SystemClock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::{
    transport_for, CircuitBreakerRegistry, ClientCaller, ClientDescriptor, ClientProtocol, Transport,
};
use crate::network::handlers::health_endpoint;
use crate::network::{NetworkConfig, NetworkModule, RpcConfig, ShutdownController};
use crate::rpc::{DeputyConfig, DeputyForwarder, RpcServer};
use crate::service::endpoint::{Endpoint, EndpointRef, RequestForwarder};
use crate::service::logging::{init_logging, LoggerConfig};
use crate::service::metrics::{ContextMetrics, MetricsSink, RecorderSink};
use crate::service::request::Protocol;
use crate::service::router::Router;
use crate::service::runtime_metrics::{start_runtime_metrics, RuntimeMetricsOptions};
use crate::service::tracer::Tracer;

/// Installs the process-wide subscriber from `logger.*`.
///
/// # Errors
///
/// Fails on a malformed `logger.*` key, an unopenable log file, or when a
/// subscriber is already installed.
pub fn init_logging_from(config: &StaticConfig) -> anyhow::Result<()> {
    init_logging(&LoggerConfig::from_config(config)?)
}

pub struct GatewayBuilder {
    config: StaticConfig,
    metrics: ContextMetrics,
    tracer: Tracer,
    clock: Arc<dyn ClockSource>,
    breakers: Arc<CircuitBreakerRegistry>,
    router: Arc<Router>,
    clients: BTreeMap<String, Arc<ClientCaller>>,
    deputy: Option<Arc<dyn RequestForwarder>>,
}

impl GatewayBuilder {
    /// Starts a builder that reports through the `metrics` facade and
    /// discards spans.
    #[must_use]
    pub fn new(config: StaticConfig) -> Self {
        let metrics = ContextMetrics::new(Arc::new(RecorderSink));
        let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
        Self {
            breakers: Arc::new(CircuitBreakerRegistry::new(Arc::clone(&clock), metrics.clone())),
            config,
            metrics,
            tracer: Tracer::noop(),
            clock,
            router: Arc::new(Router::new()),
            clients: BTreeMap::new(),
            deputy: None,
        }
    }

    fn reset_breakers(&mut self) {
        self.breakers = Arc::new(CircuitBreakerRegistry::new(
            Arc::clone(&self.clock),
            self.metrics.clone(),
        ));
    }

    /// Replaces the metrics sink. Call before registering clients.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = ContextMetrics::new(sink);
        self.reset_breakers();
        self
    }

    /// Replaces the breaker clock. Call before registering clients.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self.reset_breakers();
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Enables deputy forwarding on RPC endpoints registered afterwards.
    ///
    /// # Errors
    ///
    /// Fails on a malformed `tchannel.*` key.
    pub fn with_deputy(mut self) -> anyhow::Result<Self> {
        let config = DeputyConfig::from_config(&self.config).context("reading deputy config")?;
        self.deputy = Some(Arc::new(DeputyForwarder::new(config)));
        Ok(self)
    }

    #[must_use]
    pub fn config(&self) -> &StaticConfig {
        &self.config
    }

    #[must_use]
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Registers a client read from `clients.<client_id>.*` using the
    /// transport of its protocol. `methods` maps wire procedures to short
    /// method names.
    ///
    /// # Errors
    ///
    /// Fails on missing or malformed client config, a duplicate client id,
    /// or when the transport cannot be built.
    pub fn client(
        &mut self,
        client_id: &str,
        protocol: ClientProtocol,
        methods: &[(&str, &str)],
    ) -> anyhow::Result<Arc<ClientCaller>> {
        let descriptor = self.descriptor(client_id, protocol, methods)?;
        let transport = transport_for(&descriptor).with_context(|| format!("building transport for {client_id}"))?;
        self.install_client(descriptor, transport)
    }

    /// Like [`GatewayBuilder::client`] with a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// Fails on missing or malformed client config or a duplicate id.
    pub fn client_with_transport(
        &mut self,
        client_id: &str,
        protocol: ClientProtocol,
        methods: &[(&str, &str)],
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<ClientCaller>> {
        let descriptor = self.descriptor(client_id, protocol, methods)?;
        self.install_client(descriptor, transport)
    }

    fn descriptor(
        &self,
        client_id: &str,
        protocol: ClientProtocol,
        methods: &[(&str, &str)],
    ) -> anyhow::Result<ClientDescriptor> {
        if self.clients.contains_key(client_id) {
            anyhow::bail!("client {client_id} registered twice");
        }
        let methods: HashMap<String, String> = methods
            .iter()
            .map(|(procedure, short)| ((*procedure).to_string(), (*short).to_string()))
            .collect();
        ClientDescriptor::from_config(&self.config, client_id, protocol, methods)
            .with_context(|| format!("reading config of client {client_id}"))
    }

    fn install_client(
        &mut self,
        descriptor: ClientDescriptor,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Arc<ClientCaller>> {
        let client_id = descriptor.client_id.clone();
        let caller = Arc::new(
            ClientCaller::new(Arc::new(descriptor), transport, Arc::clone(&self.breakers))
                .with_tracer(self.tracer.clone()),
        );
        self.clients.insert(client_id.clone(), Arc::clone(&caller));
        info!(client_id = %client_id, "Registered client");
        Ok(caller)
    }

    /// Registers an endpoint with the builder's tracer and, for RPC, the
    /// deputy forwarder when enabled.
    ///
    /// # Errors
    ///
    /// Fails when the address collides with an existing endpoint or the
    /// path template is malformed.
    pub fn endpoint(&mut self, endpoint: Endpoint) -> anyhow::Result<EndpointRef> {
        let mut endpoint = endpoint.with_tracer(self.tracer.clone());
        if endpoint.descriptor().protocol == Protocol::Rpc {
            if let Some(deputy) = &self.deputy {
                endpoint = endpoint.with_forwarder(Arc::clone(deputy));
            }
        }
        Ok(self.router.register(endpoint)?)
    }

    /// Registers the health endpoint and builds both listeners. The RPC
    /// listener exists only when an RPC endpoint was registered.
    ///
    /// # Errors
    ///
    /// Fails on malformed listener config or a health route collision.
    pub fn build(mut self) -> anyhow::Result<Gateway> {
        let network = NetworkConfig::from_config(&self.config).context("reading http config")?;
        self.endpoint(health_endpoint(&network.service_name))?;

        let shutdown = Arc::new(ShutdownController::new());
        let http = NetworkModule::new(
            network,
            Arc::clone(&self.router),
            self.metrics.clone(),
            Arc::clone(&shutdown),
        );

        let has_rpc = self
            .router
            .endpoints()
            .iter()
            .any(|e| e.descriptor().protocol == Protocol::Rpc);
        let rpc = if has_rpc {
            let config = RpcConfig::from_config(&self.config).context("reading tchannel config")?;
            Some(RpcServer::new(
                config,
                Arc::clone(&self.router),
                self.metrics.clone(),
                Arc::clone(&shutdown),
            ))
        } else {
            None
        };

        let runtime = RuntimeMetricsOptions::from_config(&self.config).context("reading runtime metrics config")?;

        Ok(Gateway {
            http,
            rpc,
            router: self.router,
            breakers: self.breakers,
            clients: self.clients,
            metrics: self.metrics,
            shutdown,
            runtime,
            http_addr: None,
            rpc_addr: None,
        })
    }
}

impl std::fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("router", &self.router)
            .field("deputy", &self.deputy.is_some())
            .finish_non_exhaustive()
    }
}

/// An assembled gateway: HTTP listener, optional RPC listener and the
/// shared registries.
pub struct Gateway {
    http: NetworkModule,
    rpc: Option<RpcServer>,
    router: Arc<Router>,
    breakers: Arc<CircuitBreakerRegistry>,
    clients: BTreeMap<String, Arc<ClientCaller>>,
    metrics: ContextMetrics,
    shutdown: Arc<ShutdownController>,
    runtime: RuntimeMetricsOptions,
    http_addr: Option<SocketAddr>,
    rpc_addr: Option<SocketAddr>,
}

impl Gateway {
    /// Binds every listener.
    ///
    /// # Errors
    ///
    /// Fails when an address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.http_addr = Some(self.http.start().await.context("binding http listener")?);
        if let Some(rpc) = self.rpc.as_mut() {
            self.rpc_addr = Some(rpc.start().await.context("binding rpc listener")?);
        }
        Ok(())
    }

    #[must_use]
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    #[must_use]
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    #[must_use]
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<Arc<ClientCaller>> {
        self.clients.get(client_id).cloned()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Serves both listeners until `shutdown` resolves, then drains them
    /// and stops the runtime metrics collector.
    ///
    /// # Errors
    ///
    /// Fails if `start()` was not called or a listener hits a fatal error.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            shutdown.await;
            trigger.cancel();
        });
        let signal = |token: CancellationToken| async move { token.cancelled().await };

        let mut collector = start_runtime_metrics(self.runtime, self.metrics.clone());

        let http = self.http.serve(signal(stop.clone()));
        let result = match self.rpc {
            Some(rpc) => tokio::try_join!(http, rpc.serve(signal(stop.clone()))).map(|_| ()),
            None => http.await,
        };
        if result.is_err() {
            stop.cancel();
        }

        if let Some(worker) = collector.as_mut() {
            worker.stop().await;
        }
        info!("Gateway stopped");
        result
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("http_addr", &self.http_addr)
            .field("rpc_addr", &self.rpc_addr)
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
