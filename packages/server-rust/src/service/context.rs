//! Pooled per-request context.
//!
//! A [`RequestContext`] is checked out of a [`ContextPool`] for exactly one
//! request, reset from that request's parts, handed to the handler, and
//! cleared and returned when its [`PooledContext`] guard drops. The guard
//! drops on every exit path, including unwinding from a panic.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::Query;
use bytes::Bytes;
use gantry_core::{Backend, HandlerError};
use http::request::Parts;
use http::{HeaderMap, Method, Uri};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::Span;

use crate::backend::{BackendUnavailable, ConnectionManager};

/// Request headers that carry a correlation id, in order of preference.
pub const CORRELATION_HEADERS: [&str; 2] = ["x-correlation-id", "x-b3-traceid"];

// ---------------------------------------------------------------------------
// Request extensions set by the interceptor chain
// ---------------------------------------------------------------------------

/// Correlation id assigned by the context-injection interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub Arc<str>);

/// Marks a request that asked for a websocket upgrade.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketUpgrade;

/// Marks a request whose client accepts server-sent events.
#[derive(Debug, Clone, Copy)]
pub struct ServerPush;

/// Claims of a bearer token accepted by the auth interceptor.
#[derive(Debug, Clone)]
pub struct AuthClaims(pub Arc<serde_json::Value>);

/// Returns the first non-empty correlation header, if any.
#[must_use]
pub fn correlation_id_from(headers: &HeaderMap) -> Option<String> {
    CORRELATION_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

/// Generates a fresh 32-hex-digit trace id.
#[must_use]
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// State scoped to one in-flight request.
#[derive(Debug)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    params: HashMap<String, String>,
    body: Bytes,
    route: Option<Arc<str>>,
    correlation_id: String,
    span: Span,
    websocket: bool,
    server_push: bool,
    claims: Option<Arc<serde_json::Value>>,
    /// Shared with every context; never reset.
    backends: Arc<ConnectionManager>,
}

impl RequestContext {
    fn new(backends: Arc<ConnectionManager>) -> Self {
        Self {
            method: Method::GET,
            uri: Uri::default(),
            headers: HeaderMap::new(),
            params: HashMap::new(),
            body: Bytes::new(),
            route: None,
            correlation_id: String::new(),
            span: Span::none(),
            websocket: false,
            server_push: false,
            claims: None,
            backends,
        }
    }

    /// Loads the context from a new request.
    ///
    /// Every per-request field is cleared first, then derived from `parts`:
    /// the correlation id comes from the injected [`CorrelationId`] extension,
    /// falling back to the correlation headers, falling back to a new trace id.
    pub fn reset(
        &mut self,
        parts: Parts,
        body: Bytes,
        params: Vec<(String, String)>,
        route: Arc<str>,
    ) {
        self.clear();

        let Parts {
            method,
            uri,
            headers,
            extensions,
            ..
        } = parts;

        self.correlation_id = extensions
            .get::<CorrelationId>()
            .map(|id| id.0.to_string())
            .or_else(|| correlation_id_from(&headers))
            .unwrap_or_else(new_trace_id);
        self.websocket = extensions.get::<WebSocketUpgrade>().is_some();
        self.server_push = extensions.get::<ServerPush>().is_some();
        self.claims = extensions.get::<AuthClaims>().map(|c| Arc::clone(&c.0));

        self.span = tracing::info_span!(
            "handler",
            correlation_id = %self.correlation_id,
            method = %method,
            route = %route,
        );

        self.method = method;
        self.uri = uri;
        self.headers = headers;
        self.params.extend(params);
        self.body = body;
        self.route = Some(route);
    }

    /// Drops everything a previous request left behind.
    ///
    /// The destructuring is exhaustive on purpose: a new field fails to
    /// compile here until it is cleared.
    fn clear(&mut self) {
        let RequestContext {
            method,
            uri,
            headers,
            params,
            body,
            route,
            correlation_id,
            span,
            websocket,
            server_push,
            claims,
            backends: _,
        } = self;

        *method = Method::GET;
        *uri = Uri::default();
        headers.clear();
        params.clear();
        *body = Bytes::new();
        *route = None;
        correlation_id.clear();
        *span = Span::none();
        *websocket = false;
        *server_push = false;
        *claims = None;
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a `{name}` segment of the matched route.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Value of a query-string parameter, percent-decoded.
    #[must_use]
    pub fn query(&self, name: &str) -> Option<String> {
        Query::<HashMap<String, String>>::try_from_uri(&self.uri)
            .ok()
            .and_then(|Query(mut pairs)| pairs.remove(name))
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decodes the JSON request body.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam("body")` if the body is not valid JSON for `T`.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body).map_err(|_| HandlerError::invalid_param("body"))
    }

    /// Pattern of the route that matched, e.g. `/users/{id}`.
    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Span every log line of this request should be recorded under.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    #[must_use]
    pub fn accepts_server_push(&self) -> bool {
        self.server_push
    }

    #[must_use]
    pub fn claims(&self) -> Option<&serde_json::Value> {
        self.claims.as_deref()
    }

    /// Typed client for backend `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendUnavailable`] while the backend is not connected.
    pub fn backend<T: Backend>(&self, name: &str) -> Result<Arc<T>, BackendUnavailable> {
        self.backends.get::<T>(name).ok_or_else(|| BackendUnavailable {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn backends(&self) -> &ConnectionManager {
        &self.backends
    }
}

// ---------------------------------------------------------------------------
// ContextPool
// ---------------------------------------------------------------------------

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Contexts allocated over the pool's lifetime.
    pub allocated: usize,
    /// Contexts currently parked in the freelist.
    pub idle: usize,
}

/// Freelist of reusable request contexts.
///
/// The mutex guards only the push/pop of a box, never handler execution.
#[derive(Debug)]
pub struct ContextPool {
    free: Mutex<Vec<Box<RequestContext>>>,
    backends: Arc<ConnectionManager>,
    max_idle: usize,
    allocated: AtomicUsize,
}

impl ContextPool {
    #[must_use]
    pub fn new(backends: Arc<ConnectionManager>, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            backends,
            max_idle,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Checks out a context, allocating one if the freelist is empty.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledContext {
        let ctx = self.free.lock().pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Box::new(RequestContext::new(Arc::clone(&self.backends)))
        });

        PooledContext {
            ctx: Some(ctx),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut ctx: Box<RequestContext>) {
        ctx.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(ctx);
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

/// Exclusive checkout of a [`RequestContext`]; returns it to the pool on drop.
#[derive(Debug)]
pub struct PooledContext {
    ctx: Option<Box<RequestContext>>,
    pool: Arc<ContextPool>,
}

impl Deref for PooledContext {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        // Only `Drop` takes the box out.
        self.ctx.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}
