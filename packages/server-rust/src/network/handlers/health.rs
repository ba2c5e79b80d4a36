//! Well-known health, liveness, and readiness endpoints.
//!
//! Health and liveness are ordinary route-table handlers, so they share the
//! trailing-slash and 405 behaviour of user routes. Readiness is an axum
//! route because it answers with a status code the formatter never produces.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gantry_core::HandlerError;
use http::Method;
use serde_json::{json, Value};

use super::AppState;
use crate::service::{handler_fn, HandlerFn, HealthRegistry, RouteError, RouteTable};

pub const HEALTH_PATH: &str = "/.well-known/health";
pub const ALIVE_PATH: &str = "/.well-known/alive";
pub const READY_PATH: &str = "/.well-known/ready";

/// Aggregated backend health. Always 200; the body carries the verdict.
#[must_use]
pub fn health_handler(registry: Arc<HealthRegistry>) -> HandlerFn {
    handler_fn(move |_ctx| {
        let registry = Arc::clone(&registry);
        Box::pin(async move { Ok::<_, HandlerError>(registry.aggregate().await) })
    })
}

/// Liveness: the process is serving requests.
#[must_use]
pub fn liveness_handler() -> HandlerFn {
    handler_fn(|_ctx| Box::pin(async { Ok::<_, HandlerError>(json!({ "status": "UP" })) }))
}

/// Adds the health and liveness routes to `routes`.
///
/// # Errors
///
/// Fails if the application already registered either path.
pub fn register_well_known(
    routes: &mut RouteTable,
    registry: Arc<HealthRegistry>,
) -> Result<(), RouteError> {
    routes.add(Method::GET, HEALTH_PATH, health_handler(registry))?;
    routes.add(Method::GET, ALIVE_PATH, liveness_handler())?;
    Ok(())
}

/// Readiness probe: 200 while `Ready`, 503 while starting or draining.
pub async fn readiness_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let health = state.shutdown.health_state();
    if state.shutdown.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "UP", "state": health.as_str() })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "DOWN", "state": health.as_str() })),
        )
    }
}
