//! Health endpoint and orchestrator probes.
//!
//! `GET /health` is a regular [`Endpoint`] registered in the gateway
//! router, so it carries the same metrics, span and logging as any user
//! endpoint. The liveness and readiness probes are plain axum handlers that
//! bypass the router.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use super::AppState;
use crate::network::shutdown::HealthState;
use crate::service::context::RequestContext;
use crate::service::endpoint::{Endpoint, EndpointDescriptor};
use crate::service::request::ServerRequest;
use crate::service::response::ServerResponse;
use crate::service::stack::{ExecutionStack, Terminal};

pub const HEALTH_ENDPOINT_ID: &str = "health";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthBody {
    pub ok: bool,
    pub message: String,
}

/// Answers `200` with a fixed message.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    message: String,
}

impl HealthCheck {
    #[must_use]
    pub fn new(service_name: &str) -> Self {
        Self {
            message: format!("Healthy, from {service_name}"),
        }
    }
}

#[async_trait]
impl Terminal for HealthCheck {
    async fn handle(&self, _ctx: &RequestContext, _req: &mut ServerRequest, res: &mut ServerResponse) {
        let body = HealthBody {
            ok: true,
            message: self.message.clone(),
        };
        res.write_json(200, None, &body);
    }
}

/// The built-in `GET /health` endpoint.
#[must_use]
pub fn health_endpoint(service_name: &str) -> Endpoint {
    Endpoint::new(
        EndpointDescriptor::http(HEALTH_ENDPOINT_ID, HEALTH_ENDPOINT_ID, "GET", HEALTH_PATH),
        ExecutionStack::terminal_only(Arc::new(HealthCheck::new(service_name))),
    )
}

/// Liveness probe: the process is up.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only while the gateway is `Ready`.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
