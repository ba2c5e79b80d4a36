//! Demo server: an in-memory item store behind the Gantry runtime.
//!
//! ```text
//! test-server --port 8080 --fail-connects 3 --retry-interval-ms 500
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use gantry_core::{Backend, HandlerError, Status};
use gantry_server::logging::{init_tracing, LogFormat};
use gantry_server::network::AuthConfig;
use gantry_server::{App, BackendDescriptor, NetworkConfig, NetworkModule, Outcome, RequestContext};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "test-server", about = "Gantry demo server")]
struct Args {
    #[arg(long, env = "GANTRY_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "GANTRY_PORT", default_value_t = 8080)]
    port: u16,

    /// Comma-separated allowed CORS origins.
    #[arg(long, env = "GANTRY_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    #[arg(long, env = "GANTRY_SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    shutdown_grace_ms: u64,

    #[arg(long, env = "GANTRY_MAX_BODY_BYTES", default_value_t = 2 * 1024 * 1024)]
    max_body_bytes: usize,

    #[arg(long, env = "GANTRY_METRICS_PORT")]
    metrics_port: Option<u16>,

    #[arg(long, env = "GANTRY_API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    #[arg(long, env = "GANTRY_JWKS_URL")]
    jwks_url: Option<String>,

    #[arg(long, env = "GANTRY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Number of connect attempts the demo store refuses before coming up.
    #[arg(long, default_value_t = 0)]
    fail_connects: u32,

    #[arg(long, default_value_t = 10_000)]
    retry_interval_ms: u64,
}

impl Args {
    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            max_body_bytes: self.max_body_bytes,
            metrics_port: self.metrics_port,
            auth: AuthConfig {
                api_keys: self.api_keys.clone(),
                jwks_url: self.jwks_url.clone(),
            },
            ..NetworkConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Demo backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Item {
    id: String,
    name: String,
}

#[derive(Default)]
struct MemoryStore {
    items: DashMap<String, Item>,
}

#[async_trait]
impl Backend for MemoryStore {
    async fn health_check(&self) -> Status {
        Status::Up
    }
}

const STORE: &str = "memory";

fn store_descriptor(fail_connects: u32, retry_interval: Duration) -> BackendDescriptor {
    let attempts = Arc::new(AtomicU32::new(0));
    BackendDescriptor::new(STORE, move || {
        let attempts = Arc::clone(&attempts);
        async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed);
            if attempt < fail_connects {
                anyhow::bail!("store refused connection (attempt {})", attempt + 1);
            }
            Ok(MemoryStore::default())
        }
    })
    .with_retry_interval(retry_interval)
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Creating an item that already exists returns the stored item with an
/// already-exists error, which the runtime reports as a plain success.
fn create_item(ctx: &RequestContext) -> Result<Outcome, HandlerError> {
    let store = ctx.backend::<MemoryStore>(STORE)?;
    let item: Item = ctx.bind()?;
    if item.name.trim().is_empty() {
        return Err(HandlerError::invalid_param("name"));
    }

    if let Some(existing) = store.items.get(&item.id) {
        let value = serde_json::to_value(existing.value()).map_err(anyhow::Error::from)?;
        return Ok(Outcome::partial(value, HandlerError::EntityAlreadyExists));
    }

    let value = serde_json::to_value(&item).map_err(anyhow::Error::from)?;
    store.items.insert(item.id.clone(), item);
    Ok(Outcome::data(value))
}

fn build_app(args: &Args) -> anyhow::Result<App> {
    let mut app = App::new();
    app.backend(store_descriptor(
        args.fail_connects,
        Duration::from_millis(args.retry_interval_ms),
    ));

    app.get("/items", |ctx| {
        Box::pin(async move {
            let store = ctx.backend::<MemoryStore>(STORE)?;
            let mut items: Vec<Item> = store.items.iter().map(|e| e.value().clone()).collect();
            items.sort_by(|a, b| a.id.cmp(&b.id));
            Ok::<_, HandlerError>(items)
        })
    })?
    .get("/items/{id}", |ctx| {
        Box::pin(async move {
            let store = ctx.backend::<MemoryStore>(STORE)?;
            let id = ctx.param("id").unwrap_or_default();
            store
                .items
                .get(id)
                .map(|e| e.value().clone())
                .ok_or_else(|| HandlerError::not_found("item", id))
        })
    })?
    .post("/items", |ctx| {
        Box::pin(async move { create_item(ctx).unwrap_or_else(Outcome::error) })
    })?
    .delete("/items/{id}", |ctx| {
        Box::pin(async move {
            let store = ctx.backend::<MemoryStore>(STORE)?;
            let id = ctx.param("id").unwrap_or_default();
            store
                .items
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| HandlerError::not_found("item", id))
        })
    })?;

    Ok(app)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, "info,gantry_server=debug")?;

    let app = build_app(&args)?;
    let mut server = NetworkModule::new(args.network_config(), app);
    let port = server.start().await?;
    info!(port, "test-server ready");

    server.serve(shutdown_signal()).await
}
