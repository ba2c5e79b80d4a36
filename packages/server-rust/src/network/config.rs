//! Network configuration types for the Gantry server.

use std::time::Duration;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// How long in-flight requests may run after shutdown is signalled.
    pub shutdown_grace: Duration,
    /// Largest request body a handler will be given.
    pub max_body_bytes: usize,
    /// Port of the Prometheus scrape endpoint. `None` disables it.
    pub metrics_port: Option<u16>,
    /// Idle request contexts kept for reuse.
    pub pool_max_idle: usize,
    /// Optional request authentication.
    pub auth: AuthConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            shutdown_grace: Duration::from_secs(5),
            max_body_bytes: 2 * 1024 * 1024, // 2 MiB
            metrics_port: None,
            pool_max_idle: 1024,
            auth: AuthConfig::default(),
        }
    }
}

/// Request authentication settings.
///
/// Both mechanisms are off by default. When both are set, API keys win.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Accepted values of the `X-Api-Key` header.
    pub api_keys: Vec<String>,
    /// JWKS document used to validate `Authorization: Bearer` tokens.
    pub jwks_url: Option<String>,
}

impl AuthConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty() || self.jwks_url.is_some()
    }
}
