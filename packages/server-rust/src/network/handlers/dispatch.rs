//! Fallback handler: converts an axum request into a [`ServerRequest`],
//! runs it through the gateway router and renders the flushed response.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use switchyard_core::{GatewayError, Headers, Origin};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::AppState;
use crate::client::transport::CONTEXT_TTL_HEADER;
use crate::service::context::{RequestContext, REQUEST_UUID_HEADER};
use crate::service::request::{Protocol, ServerRequest};
use crate::service::response::{FlushedResponse, ServerResponse};

/// Collects an axum header map into a [`Headers`] container. Values that
/// are not visible ASCII are skipped.
#[must_use]
pub fn headers_from_map(map: &HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}

/// Renders a flushed response. Header names or values that HTTP cannot
/// carry are dropped with a warning.
#[must_use]
pub fn into_http_response(flushed: FlushedResponse) -> Response {
    let status = StatusCode::from_u16(flushed.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(flushed.body));
    *response.status_mut() = status;

    let map = response.headers_mut();
    for (name, values) in flushed.headers.iter() {
        let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = %name, "Dropping response header with invalid name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    map.append(header.clone(), value);
                }
                Err(_) => tracing::warn!(header = %name, "Dropping response header with invalid value"),
            }
        }
    }
    if !map.contains_key(CONTENT_TYPE) {
        if let Ok(value) = HeaderValue::from_str(&flushed.content_type) {
            map.insert(CONTENT_TYPE, value);
        }
    }
    response
}

fn render(mut res: ServerResponse) -> Response {
    match res.flush() {
        Some(flushed) => into_http_response(flushed),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn render_error(err: GatewayError) -> Response {
    let mut res = ServerResponse::new(Protocol::Http);
    res.send_gateway_error(err);
    render(res)
}

/// Caller budget announced in `Context-TTL-MS`, if any.
fn inbound_ttl(headers: &Headers) -> Option<Duration> {
    headers
        .get(CONTEXT_TTL_HEADER)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Routes every request that no probe route claimed.
pub async fn dispatch_handler(State(state): State<AppState>, request: Request) -> Response {
    let _in_flight = state.shutdown.in_flight_guard(Protocol::Http);
    let (parts, body) = request.into_parts();
    let headers = headers_from_map(&parts.headers);
    let uuid = headers
        .get(REQUEST_UUID_HEADER)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    let span = tracing::info_span!(
        "http_request",
        method = %parts.method,
        path = %parts.uri.path(),
        request_uuid = %uuid
    );

    async move {
        let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                return render_error(
                    GatewayError::bad_request("Could not read request body")
                        .with_origin(Origin::Codec)
                        .with_cause(err),
                );
            }
        };

        // Dropped with this future when the caller disconnects.
        let token = CancellationToken::new();
        let _disconnect = token.clone().drop_guard();
        let mut ctx = RequestContext::new(uuid, state.metrics.clone()).with_cancellation(token);
        if let Some(ttl) = inbound_ttl(&headers) {
            ctx = ctx.with_timeout(ttl);
        }

        let mut req = ServerRequest::http(parts.method.as_str(), parts.uri, headers, body);
        let endpoint = match state.router.dispatch(&mut req) {
            Ok(endpoint) => endpoint,
            Err(err) => return render_error(err),
        };
        render(endpoint.handle(ctx, req).await)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::network::config::NetworkConfig;
    use crate::network::shutdown::ShutdownController;
    use crate::service::endpoint::{Endpoint, EndpointDescriptor};
    use crate::service::metrics::{ContextMetrics, InMemoryMetrics};
    use crate::service::router::Router;
    use crate::service::stack::{ExecutionStack, Terminal};

    /// Holds the request until its context is cancelled or five seconds pass.
    struct WaitForCancel;

    #[async_trait]
    impl Terminal for WaitForCancel {
        async fn handle(&self, ctx: &RequestContext, _req: &mut ServerRequest, res: &mut ServerResponse) {
            let cancelled = tokio::select! {
                () = ctx.cancellation().cancelled() => true,
                () = tokio::time::sleep(Duration::from_secs(5)) => false,
            };
            res.write_json(200, None, &json!({ "cancelled": cancelled }));
        }
    }

    fn state_with_slow_endpoint() -> AppState {
        let router = Router::new();
        router
            .register(Endpoint::new(
                EndpointDescriptor::http("slow", "wait", "GET", "/slow"),
                ExecutionStack::terminal_only(Arc::new(WaitForCancel)),
            ))
            .unwrap();
        AppState {
            router: Arc::new(router),
            metrics: ContextMetrics::new(Arc::new(InMemoryMetrics::new())),
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
        }
    }

    async fn call_slow(state: AppState, ttl: Option<&str>) -> (serde_json::Value, Duration) {
        let mut builder = axum::http::Request::builder().method("GET").uri("/slow");
        if let Some(ttl) = ttl {
            builder = builder.header(CONTEXT_TTL_HEADER, ttl);
        }
        let request = builder.body(Body::empty()).unwrap();
        let start = tokio::time::Instant::now();
        let response = dispatch_handler(State(state), request).await;
        let elapsed = start.elapsed();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (serde_json::from_slice(&body).unwrap(), elapsed)
    }

    #[tokio::test(start_paused = true)]
    async fn context_ttl_header_cancels_the_request() {
        let (body, elapsed) = call_slow(state_with_slow_endpoint(), Some("20")).await;
        assert_eq!(body["cancelled"], true);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn request_without_ttl_is_not_cancelled() {
        let state = state_with_slow_endpoint();
        let (body, elapsed) = call_slow(state.clone(), None).await;
        assert_eq!(body["cancelled"], false);
        assert!(elapsed >= Duration::from_secs(5));
        assert_eq!(state.shutdown.in_flight_count(), 0);
    }

    #[test]
    fn header_map_round_trip_keeps_multi_values() {
        let mut map = HeaderMap::new();
        map.append("x-tag", HeaderValue::from_static("a"));
        map.append("x-tag", HeaderValue::from_static("b"));
        let headers = headers_from_map(&map);
        assert_eq!(headers.get_all("X-Tag"), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn flushed_response_renders_status_headers_and_content_type() {
        let mut headers = Headers::new();
        headers.set("some-res-header", "something");
        headers.set("bad header", "dropped");
        let response = into_http_response(FlushedResponse {
            status: 201,
            headers,
            body: Bytes::from_static(b"{}"),
            content_type: "application/json".into(),
            exception: None,
            error_message: None,
        });
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["some-res-header"], "something");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert!(response.headers().get("bad header").is_none());
    }

    #[test]
    fn ttl_header_is_parsed_in_millis() {
        let headers: Headers = [(CONTEXT_TTL_HEADER, "250")].into_iter().collect();
        assert_eq!(inbound_ttl(&headers), Some(Duration::from_millis(250)));
        let headers: Headers = [(CONTEXT_TTL_HEADER, "soon")].into_iter().collect();
        assert_eq!(inbound_ttl(&headers), None);
    }
}
