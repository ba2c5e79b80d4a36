//! Built-in handlers and the state shared with axum routes.

pub mod health;

pub use health::{
    health_handler, liveness_handler, readiness_handler, register_well_known, ALIVE_PATH,
    HEALTH_PATH, READY_PATH,
};

use std::sync::Arc;

use super::ShutdownController;

/// State passed to axum-native routes via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
}
