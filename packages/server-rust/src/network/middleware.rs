//! HTTP middleware stack for the Gantry server.
//!
//! Layer order, outermost first:
//!
//! 1. context injection: `SetRequestId` assigns the correlation id, then the
//!    response encoding and in-flight guard are attached
//! 2. websocket-upgrade detection
//! 3. server-push detection (`Accept: text/event-stream`)
//! 4. `PropagateRequestId` echoes the correlation id as `X-Correlation-ID`
//! 5. tracing span (`tower-http` `TraceLayer`)
//! 6. CORS
//! 7. access log
//! 8. request metrics
//! 9. authentication
//! 10. panic recovery
//! 11. user middleware, first registered outermost

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::{HeaderName, HeaderValue, ACCEPT, CONNECTION, UPGRADE};
use axum::http::Method;
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, Authenticator};
use super::config::NetworkConfig;
use super::recovery::RecoveryLayer;
use super::shutdown::ShutdownController;
use crate::service::context::{
    correlation_id_from, new_trace_id, CorrelationId, ServerPush, WebSocketUpgrade,
};
use crate::service::{Encoding, MatchedRoute, Middleware};

const CORRELATION_HEADER: &str = "x-correlation-id";

// ---------------------------------------------------------------------------
// Correlation ids
// ---------------------------------------------------------------------------

/// Supplies the correlation id when the request carries no
/// `X-Correlation-Id`: the `X-B3-TraceID` value, else a fresh trace id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationIdMaker;

impl MakeRequestId for CorrelationIdMaker {
    fn make_request_id<B>(&mut self, request: &http::Request<B>) -> Option<RequestId> {
        let id = correlation_id_from(request.headers()).unwrap_or_else(new_trace_id);
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

// ---------------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------------

/// (1) Exposes the assigned correlation id and the response encoding to the
/// rest of the chain.
async fn inject_context(
    State(shutdown): State<Arc<ShutdownController>>,
    mut request: Request,
    next: Next,
) -> Response {
    let _in_flight = shutdown.in_flight_guard();

    let correlation_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_trace_id);
    let encoding = Encoding::from_content_type(request.headers());

    let extensions = request.extensions_mut();
    extensions.insert(CorrelationId(Arc::from(correlation_id)));
    extensions.insert(encoding);

    next.run(request).await
}

/// (2)
async fn detect_websocket(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));

    if upgrade && connection {
        request.extensions_mut().insert(WebSocketUpgrade);
    }
    next.run(request).await
}

/// (3)
async fn detect_server_push(mut request: Request, next: Next) -> Response {
    let wants_stream = request
        .headers()
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"));

    if wants_stream {
        request.extensions_mut().insert(ServerPush);
    }
    next.run(request).await
}

/// (7)
async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| Arc::clone(&id.0));

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_secs_f64() * 1000.0,
        correlation_id = correlation_id.as_deref().unwrap_or_default(),
        "request completed"
    );
    response
}

/// (8) Labels by route pattern, never by raw path, to bound cardinality.
async fn record_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());

    let response = next.run(request).await;

    let route = response
        .extensions()
        .get::<MatchedRoute>()
        .map(|r| r.0.to_string())
        .or(matched_path)
        .unwrap_or_else(|| "unmatched".to_string());
    let status = response.status().as_u16().to_string();

    metrics::counter!(
        "app_http_requests_total",
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "app_http_response_seconds",
        "method" => method,
        "route" => route
    )
    .record(start.elapsed().as_secs_f64());

    response
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Wraps `router` in user middleware and the fixed interceptor chain.
///
/// Must be called after every route and the fallback are registered.
pub fn apply_layers(
    router: Router,
    config: &NetworkConfig,
    shutdown: Arc<ShutdownController>,
    auth: Arc<Authenticator>,
    custom: &[Middleware],
) -> Router {
    // `Router::layer` wraps what is already there, so the last call is the
    // outermost. Walk user middleware back to front.
    let mut router = router;
    for middleware in custom.iter().rev() {
        let middleware = Arc::clone(middleware);
        router = router.layer(from_fn(move |request: Request, next: Next| {
            let middleware = Arc::clone(&middleware);
            async move { middleware(request, next).await }
        }));
    }

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let correlation_id = request
            .extensions()
            .get::<CorrelationId>()
            .map(|id| id.0.to_string())
            .unwrap_or_default();
        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            correlation_id = %correlation_id,
        )
    });

    let correlation_header = HeaderName::from_static(CORRELATION_HEADER);
    let stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            correlation_header.clone(),
            CorrelationIdMaker,
        ))
        .layer(from_fn_with_state(shutdown, inject_context))
        .layer(from_fn(detect_websocket))
        .layer(from_fn(detect_server_push))
        .layer(PropagateRequestIdLayer::new(correlation_header))
        .layer(trace)
        .layer(build_cors_layer(&config.cors_origins))
        .layer(from_fn(access_log))
        .layer(from_fn(record_metrics))
        .layer(from_fn_with_state(auth, auth_middleware))
        .layer(RecoveryLayer);

    router.layer(stack)
}

/// A `"*"` entry allows any origin; otherwise each entry is parsed into an
/// allowlist and unparsable entries are dropped.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(CORRELATION_HEADER)])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
