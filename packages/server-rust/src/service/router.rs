//! Route table: dispatches method + path to exactly one handler.
//!
//! Patterns are literal segments and `{name}` parameters, one segment each.
//! The table is filled before boot and read-only afterwards; lookups scan the
//! whole table so a miss can be classified as 405 (path known under another
//! method) or 404 (path unknown).

use std::fmt;
use std::sync::Arc;

use http::Method;

use super::context::RequestContext;
use super::respond::Outcome;
use crate::backend::BoxFuture;

// ---------------------------------------------------------------------------
// Handler type
// ---------------------------------------------------------------------------

/// Type-erased request handler.
pub type HandlerFn =
    Arc<dyn for<'a> Fn(&'a RequestContext) -> BoxFuture<'a, Outcome> + Send + Sync>;

/// Erases a handler closure, converting its result into an [`Outcome`].
///
/// Closures take the form `|ctx| Box::pin(async move { ... })`.
pub fn handler_fn<F, R>(f: F) -> HandlerFn
where
    F: for<'a> Fn(&'a RequestContext) -> BoxFuture<'a, R> + Send + Sync + 'static,
    R: Into<Outcome> + 'static,
{
    erase(move |ctx| {
        let fut = f(ctx);
        Box::pin(async move { fut.await.into() })
    })
}

fn erase<F>(f: F) -> HandlerFn
where
    F: for<'a> Fn(&'a RequestContext) -> BoxFuture<'a, Outcome> + Send + Sync + 'static,
{
    Arc::new(f)
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Errors raised while registering routes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route pattern must start with '/': {0}")]
    MissingLeadingSlash(String),
    #[error("route pattern has an unnamed or unterminated parameter: {0}")]
    InvalidParam(String),
    #[error("route already registered: {method} {pattern}")]
    Duplicate { method: Method, pattern: String },
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    if !pattern.starts_with('/') {
        return Err(RouteError::MissingLeadingSlash(pattern.to_string()));
    }

    split_path(pattern)
        .map(|seg| {
            if let Some(name) = seg.strip_prefix('{') {
                match name.strip_suffix('}') {
                    Some(name) if !name.is_empty() && !name.contains(['{', '}']) => {
                        Ok(Segment::Param(name.to_string()))
                    }
                    _ => Err(RouteError::InvalidParam(pattern.to_string())),
                }
            } else if seg.contains(['{', '}']) {
                Err(RouteError::InvalidParam(pattern.to_string()))
            } else {
                Ok(Segment::Literal(seg.to_string()))
            }
        })
        .collect()
}

/// Two patterns overlap if they differ only in parameter names.
fn same_shape(a: &[Segment], b: &[Segment]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|pair| match pair {
            (Segment::Literal(x), Segment::Literal(y)) => x == y,
            (Segment::Param(_), Segment::Param(_)) => true,
            _ => false,
        })
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

struct Route {
    method: Method,
    /// Pattern as registered (without the auto-added trailing slash).
    pattern: Arc<str>,
    segments: Vec<Segment>,
    handler: HandlerFn,
}

impl Route {
    /// Path parameters if `path` matches this route's segments.
    fn matches(&self, path: &[&str]) -> Option<Vec<(String, String)>> {
        if path.len() != self.segments.len() {
            return None;
        }

        let mut params = Vec::new();
        for (segment, actual) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Param(name) if !actual.is_empty() => {
                    params.push((name.clone(), (*actual).to_string()));
                }
                _ => return None,
            }
        }
        Some(params)
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

/// Outcome of a route lookup.
pub enum Resolution {
    Matched {
        handler: HandlerFn,
        pattern: Arc<str>,
        params: Vec<(String, String)>,
    },
    /// The path exists, but not under the requested method.
    MethodNotAllowed { allowed: Vec<Method> },
    NotFound,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Matched {
                pattern, params, ..
            } => f
                .debug_struct("Matched")
                .field("pattern", pattern)
                .field("params", params)
                .finish_non_exhaustive(),
            Resolution::MethodNotAllowed { allowed } => f
                .debug_struct("MethodNotAllowed")
                .field("allowed", allowed)
                .finish(),
            Resolution::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Method + path-template routing table.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Create a new empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` on `pattern`, plus `pattern + "/"`.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed pattern or when an equivalent route
    /// (same method, same shape) is already registered.
    pub fn add(&mut self, method: Method, pattern: &str, handler: HandlerFn) -> Result<(), RouteError> {
        let segments = parse_pattern(pattern)?;

        let mut variants = vec![segments.clone()];
        if pattern != "/" && !pattern.ends_with('/') {
            let mut slashed = segments;
            slashed.push(Segment::Literal(String::new()));
            variants.push(slashed);
        }

        for variant in &variants {
            if self
                .routes
                .iter()
                .any(|r| r.method == method && same_shape(&r.segments, variant))
            {
                return Err(RouteError::Duplicate {
                    method,
                    pattern: pattern.to_string(),
                });
            }
        }

        let pattern: Arc<str> = Arc::from(pattern);
        for segments in variants {
            self.routes.push(Route {
                method: method.clone(),
                pattern: Arc::clone(&pattern),
                segments,
                handler: Arc::clone(&handler),
            });
        }
        Ok(())
    }

    /// Number of registered entries, trailing-slash variants included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finds the handler for `method` and `path`.
    ///
    /// Among routes that match, the one with the most literal segments wins,
    /// so `/users/me` is preferred over `/users/{id}`.
    #[must_use]
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
        let parts: Vec<&str> = split_path(path).collect();

        let mut best: Option<(&Route, Vec<(String, String)>)> = None;
        let mut allowed: Vec<Method> = Vec::new();

        for route in &self.routes {
            let Some(params) = route.matches(&parts) else {
                continue;
            };

            if route.method == *method {
                let better = best
                    .as_ref()
                    .map_or(true, |(b, _)| route.literal_count() > b.literal_count());
                if better {
                    best = Some((route, params));
                }
            } else if !allowed.contains(&route.method) {
                allowed.push(route.method.clone());
            }
        }

        match best {
            Some((route, params)) => Resolution::Matched {
                handler: Arc::clone(&route.handler),
                pattern: Arc::clone(&route.pattern),
                params,
            },
            None if !allowed.is_empty() => {
                allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                Resolution::MethodNotAllowed { allowed }
            }
            None => Resolution::NotFound,
        }
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| format!("{} {}", r.method, r.pattern)))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
