//! axum handlers of the inbound HTTP listener.
//!
//! [`AppState`] is the state carried through axum extractors. Every route
//! other than the probes falls through to [`dispatch_handler`], which hands
//! the request to the gateway router.

pub mod dispatch;
pub mod health;

pub use dispatch::dispatch_handler;
pub use health::{health_endpoint, liveness_handler, readiness_handler, HealthCheck};

use std::sync::Arc;

use super::{NetworkConfig, ShutdownController};
use crate::service::metrics::ContextMetrics;
use crate::service::router::Router;

/// Cloned into every handler; all fields are shared handles.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    /// Root metrics scope of the listener.
    pub metrics: ContextMetrics,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
}
