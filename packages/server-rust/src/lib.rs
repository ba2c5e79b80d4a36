//! Gantry server: an embeddable HTTP runtime with pooled request contexts,
//! normalized error responses, and self-healing backend connections.
//!
//! ```no_run
//! use gantry_core::HandlerError;
//! use gantry_server::{App, NetworkConfig, NetworkModule};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut app = App::new();
//! app.get("/ping", |_ctx| Box::pin(async { Ok::<_, HandlerError>("pong") }))?;
//!
//! let mut server = NetworkModule::new(NetworkConfig::default(), app);
//! server.start().await?;
//! server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod backend;
pub mod logging;
pub mod network;
pub mod service;

pub use backend::{BackendDescriptor, BackendUnavailable, ConnectionManager, RetryPolicy};
pub use network::{NetworkConfig, NetworkModule, ShutdownController};
pub use service::{App, Outcome, RequestContext};
