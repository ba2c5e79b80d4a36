//! Optional backend integrations and their connection lifecycle.
//!
//! - [`descriptor`]: what a backend is and how to connect to it
//! - [`state`]: lock-free per-backend liveness snapshots
//! - [`manager`]: startup connect plus cancellable background reconnection

pub mod descriptor;
pub mod manager;
pub mod state;

pub use descriptor::{BackendDescriptor, BackendHandle, BoxFuture, RetryPolicy};
pub use manager::ConnectionManager;
pub use state::{ConnectionSnapshot, ConnectionState, Liveness};

/// Returned to a handler that asks for a backend which is not connected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("backend '{name}' is not available")]
pub struct BackendUnavailable {
    pub name: String,
}

impl From<BackendUnavailable> for gantry_core::HandlerError {
    fn from(err: BackendUnavailable) -> Self {
        gantry_core::HandlerError::db(err)
    }
}
