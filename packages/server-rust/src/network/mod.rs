//! HTTP serving: configuration, the interceptor chain, authentication, panic
//! recovery, built-in handlers and the server lifecycle.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod recovery;
pub mod shutdown;

pub use auth::{AuthError, Authenticator, JwksCache};
pub use config::{AuthConfig, NetworkConfig};
pub use handlers::AppState;
pub use module::NetworkModule;
pub use recovery::RecoveryLayer;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
