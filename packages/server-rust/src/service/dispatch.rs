//! Innermost tower service: route lookup, context checkout, handler call,
//! response formatting.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use gantry_core::HandlerError;
use http::header::{HeaderValue, ALLOW};
use tower::Service;
use tracing::Instrument;

use super::context::{ContextPool, RequestContext};
use super::respond::{Encoding, ResponseFormatter};
use super::router::{Resolution, RouteTable};
use crate::backend::BoxFuture;

/// Route pattern that served a response, attached as a response extension.
#[derive(Debug, Clone)]
pub struct MatchedRoute(pub Arc<str>);

struct Inner {
    routes: RouteTable,
    pool: Arc<ContextPool>,
    formatter: Arc<ResponseFormatter>,
    max_body_bytes: usize,
}

/// Cheaply cloneable dispatcher over a frozen [`RouteTable`].
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        routes: RouteTable,
        pool: Arc<ContextPool>,
        formatter: Arc<ResponseFormatter>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes,
                pool,
                formatter,
                max_body_bytes,
            }),
        }
    }

    #[must_use]
    pub fn formatter(&self) -> &Arc<ResponseFormatter> {
        &self.inner.formatter
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.inner.pool
    }

    async fn dispatch(self, req: Request<Body>) -> Response {
        let inner = &*self.inner;
        let encoding = req
            .extensions()
            .get::<Encoding>()
            .copied()
            .unwrap_or_else(|| Encoding::from_content_type(req.headers()));

        match inner.routes.resolve(req.method(), req.uri().path()) {
            Resolution::NotFound => inner
                .formatter
                .error_response(encoding, &HandlerError::InvalidRoute),
            Resolution::MethodNotAllowed { allowed } => {
                let err = HandlerError::MethodMissing {
                    method: req.method().to_string(),
                    path: req.uri().path().to_string(),
                };
                let mut response = inner.formatter.error_response(encoding, &err);
                let allow = allowed
                    .iter()
                    .map(http::Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    response.headers_mut().insert(ALLOW, value);
                }
                response
            }
            Resolution::Matched {
                handler,
                pattern,
                params,
            } => {
                let (parts, body) = req.into_parts();
                let method = parts.method.clone();

                let body = match axum::body::to_bytes(body, inner.max_body_bytes).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::debug!(error = %err, "failed to read request body");
                        return inner
                            .formatter
                            .error_response(encoding, &HandlerError::invalid_param("body"));
                    }
                };

                let mut ctx = inner.pool.acquire();
                ctx.reset(parts, body, params, Arc::clone(&pattern));
                let span = ctx.span().clone();

                let ctx_ref: &RequestContext = &ctx;
                let outcome = handler(ctx_ref).instrument(span).await;

                let mut response = inner.formatter.respond(&method, outcome, encoding);
                response.extensions_mut().insert(MatchedRoute(pattern));
                response
            }
        }
    }
}

impl Service<Request<Body>> for Dispatcher {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.dispatch(req).await) })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.inner.routes)
            .field("max_body_bytes", &self.inner.max_body_bytes)
            .finish_non_exhaustive()
    }
}
