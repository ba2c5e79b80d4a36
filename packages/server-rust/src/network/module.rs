//! Network module with deferred startup lifecycle.
//!
//! `new()` takes the configuration and the application definition,
//! `start()` connects backends, freezes routes and binds the listener, and
//! `serve()` accepts connections until the shutdown signal, then drains.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use super::auth::Authenticator;
use super::config::NetworkConfig;
use super::handlers::{readiness_handler, register_well_known, AppState, READY_PATH};
use super::middleware::apply_layers;
use super::shutdown::ShutdownController;
use crate::backend::ConnectionManager;
use crate::service::{App, ContextPool, Dispatcher, HealthRegistry, ResponseFormatter};

/// Manages the HTTP server lifecycle.
///
/// 1. `new()` -- stores configuration and the application definition
/// 2. `start()` -- connects backends, builds the router, binds the listener
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    app: Option<App>,
    listener: Option<TcpListener>,
    router: Option<Router>,
    shutdown: Arc<ShutdownController>,
    formatter: Arc<ResponseFormatter>,
    backends: Arc<ConnectionManager>,
}

impl NetworkModule {
    /// Creates the module without touching the network or any backend.
    #[must_use]
    pub fn new(config: NetworkConfig, app: App) -> Self {
        Self {
            config,
            app: Some(app),
            listener: None,
            router: None,
            shutdown: Arc::new(ShutdownController::new()),
            formatter: Arc::new(ResponseFormatter::new()),
            backends: Arc::new(ConnectionManager::empty()),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Backend states. Empty until `start()` has run.
    #[must_use]
    pub fn backends(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.backends)
    }

    #[must_use]
    pub fn formatter(&self) -> Arc<ResponseFormatter> {
        Arc::clone(&self.formatter)
    }

    /// The fully layered router, available after `start()`.
    #[must_use]
    pub fn router(&self) -> Option<Router> {
        self.router.clone()
    }

    /// Connects backends, freezes the route table and binds the listener.
    ///
    /// Backends that fail to connect do not fail startup; they keep
    /// retrying in the background and report `DOWN` until they recover.
    /// Returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` already ran, two backends share a name,
    /// an application route collides with a well-known route, the JWKS
    /// cannot be fetched, the metrics exporter cannot be installed, or the
    /// address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let App {
            mut routes,
            backends,
            health_checks,
            middleware,
        } = self.app.take().context("start() already called")?;

        let manager = Arc::new(
            ConnectionManager::initialize(backends, self.shutdown.background_token()).await?,
        );

        let mut registry = HealthRegistry::from_backends(&manager);
        for (name, probe) in health_checks {
            registry.register(name, probe);
        }
        register_well_known(&mut routes, Arc::new(registry))?;

        let auth = Arc::new(Authenticator::from_config(&self.config.auth).await?);
        let pool = ContextPool::new(Arc::clone(&manager), self.config.pool_max_idle);
        let dispatcher = Dispatcher::new(
            routes,
            pool,
            Arc::clone(&self.formatter),
            self.config.max_body_bytes,
        );

        let router = Router::new()
            .route(READY_PATH, get(readiness_handler))
            .with_state(AppState {
                shutdown: Arc::clone(&self.shutdown),
            })
            .fallback_service(dispatcher);
        let router = apply_layers(
            router,
            &self.config,
            Arc::clone(&self.shutdown),
            auth,
            &middleware,
        );

        if let Some(port) = self.config.metrics_port {
            install_metrics_exporter(&self.config.host, port)?;
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let port = listener.local_addr()?.port();

        info!(
            host = %self.config.host,
            port,
            backends = manager.states().len(),
            "listener bound"
        );

        self.backends = manager;
        self.router = Some(router);
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// On the signal: health moves to `Draining`, backend retry loops are
    /// cancelled, the listener stops accepting, and in-flight requests get
    /// `shutdown_grace` to finish before the server task is aborted.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server fails with
    /// an I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .context("start() must be called before serve()")?;
        let router = self
            .router
            .context("start() must be called before serve()")?;
        let controller = self.shutdown;
        let backends = self.backends;
        let grace = self.config.shutdown_grace;

        let signalled = controller.shutdown_receiver();
        let signal_ctrl = Arc::clone(&controller);
        tokio::spawn(async move {
            shutdown.await;
            signal_ctrl.trigger_shutdown();
        });

        let stop = controller.shutdown_receiver();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(wait_signalled(stop))
                .await
        });

        if controller.set_ready() {
            info!("serving HTTP connections");
        }

        let early = tokio::select! {
            joined = &mut server => Some(joined),
            () = wait_signalled(signalled) => None,
        };

        let result = match early {
            Some(joined) => {
                // The server stopped without a signal; make sure the rest of
                // the process sees the shutdown too.
                controller.trigger_shutdown();
                joined.context("server task failed")?.map_err(anyhow::Error::from)
            }
            None => {
                info!(
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "shutdown signalled, draining"
                );
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(joined) => joined.context("server task failed")?.map_err(anyhow::Error::from),
                    Err(_) => {
                        warn!(
                            in_flight = controller.in_flight_count(),
                            "grace period expired, aborting server task"
                        );
                        server.abort();
                        Ok(())
                    }
                }
            }
        };

        backends.shutdown().await;
        if controller.wait_for_drain(grace).await {
            info!("all requests drained");
        } else {
            warn!(in_flight = controller.in_flight_count(), "requests still in flight at exit");
        }
        result
    }
}

/// Resolves once the controller's shutdown flag is set.
async fn wait_signalled(mut rx: watch::Receiver<bool>) {
    // An error means the controller is gone, which is also a stop.
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Installs the global Prometheus recorder with its own scrape listener.
fn install_metrics_exporter(host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid metrics address {host}:{port}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

impl std::fmt::Debug for NetworkModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkModule")
            .field("config", &self.config)
            .field("started", &self.listener.is_some())
            .field("health", &self.shutdown.health_state())
            .finish_non_exhaustive()
    }
}
