//! Application builder: everything the runtime needs, collected before boot.
//!
//! An [`App`] gathers routes, backend descriptors, extra health probes and
//! custom middleware. It is consumed by the server at startup and is frozen
//! from then on.

use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use gantry_core::HealthProbe;
use http::Method;

use super::router::{handler_fn, HandlerFn, RouteError, RouteTable};
use super::RequestContext;
use super::respond::Outcome;
use crate::backend::{BackendDescriptor, BoxFuture};

/// User middleware in `axum::middleware::from_fn` shape.
pub type Middleware = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Pre-boot application definition.
#[derive(Default)]
pub struct App {
    pub(crate) routes: RouteTable,
    pub(crate) backends: Vec<BackendDescriptor>,
    pub(crate) health_checks: Vec<(String, Arc<dyn HealthProbe>)>,
    pub(crate) middleware: Vec<Middleware>,
}

macro_rules! method_helper {
    ($(#[$doc:meta])* $name:ident, $method:expr) => {
        $(#[$doc])*
        ///
        /// # Errors
        ///
        /// See [`App::route`].
        pub fn $name<F, R>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, RouteError>
        where
            F: for<'a> Fn(&'a RequestContext) -> BoxFuture<'a, R> + Send + Sync + 'static,
            R: Into<Outcome> + 'static,
        {
            self.route($method, pattern, handler_fn(handler))
        }
    };
}

impl App {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` on `pattern` (and `pattern/`).
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if the pattern is malformed or the route is
    /// already registered.
    pub fn route(
        &mut self,
        method: Method,
        pattern: &str,
        handler: HandlerFn,
    ) -> Result<&mut Self, RouteError> {
        self.routes.add(method, pattern, handler)?;
        Ok(self)
    }

    method_helper!(
        /// Registers a `GET` route.
        get, Method::GET
    );
    method_helper!(
        /// Registers a `POST` route.
        post, Method::POST
    );
    method_helper!(
        /// Registers a `PUT` route.
        put, Method::PUT
    );
    method_helper!(
        /// Registers a `PATCH` route.
        patch, Method::PATCH
    );
    method_helper!(
        /// Registers a `DELETE` route.
        delete, Method::DELETE
    );

    /// Adds a backend. Backends connect in the order they are added.
    pub fn backend(&mut self, descriptor: BackendDescriptor) -> &mut Self {
        self.backends.push(descriptor);
        self
    }

    /// Adds a named health probe, reported after the backends.
    pub fn health_check(&mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) -> &mut Self {
        self.health_checks.push((name.into(), probe));
        self
    }

    /// Adds custom middleware. The first one added runs outermost.
    pub fn use_middleware<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.routes)
            .field(
                "backends",
                &self.backends.iter().map(BackendDescriptor::name).collect::<Vec<_>>(),
            )
            .field(
                "health_checks",
                &self.health_checks.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
