//! Transport-level Tower layers of the inbound HTTP listener.
//!
//! Ordering is outer-to-inner: the first layer listed sees the request
//! first and the response last. Request-scoped concerns (metrics, spans,
//! panic recovery) live in the endpoint, not here.

use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;
use crate::service::context::REQUEST_UUID_HEADER;

type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>,
            tower::layer::util::Stack<SetRequestIdLayer<MakeRequestUuid>, tower::layer::util::Identity>,
        >,
    >,
>;

/// Builds the layer stack:
///
/// 1. `SetRequestId` stamps a v4 `x-request-uuid` unless the caller sent one
/// 2. `Trace` opens the tower-http request span
/// 3. `Timeout` answers 504 once `request_timeout` elapses
/// 4. `PropagateRequestId` echoes `x-request-uuid` on the response
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let request_uuid = HeaderName::from_static(REQUEST_UUID_HEADER);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_uuid.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_uuid))
        .into_inner()
}
