//! Panic recovery middleware.
//!
//! A panic in a handler or in custom middleware becomes a 500 error response.
//! The connection task that was serving the request keeps running.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::Response;
use futures_util::FutureExt;
use gantry_core::HandlerError;
use tower::{Layer, Service};

use crate::service::respond::{render_error, Encoding};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn recovered(encoding: Encoding, payload: &(dyn Any + Send)) -> Response {
    let backtrace = Backtrace::force_capture();
    tracing::error!(
        panic = %panic_message(payload),
        backtrace = %backtrace,
        "recovered from panic while serving request"
    );
    render_error(encoding, &HandlerError::Panic)
}

// ---------------------------------------------------------------------------
// RecoveryLayer
// ---------------------------------------------------------------------------

/// Tower layer that converts panics in the wrapped service into 500s.
#[derive(Debug, Clone, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

// ---------------------------------------------------------------------------
// RecoveryService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S> Service<Request> for RecoveryService<S>
where
    S: Service<Request, Response = Response> + Send,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let encoding = req.extensions().get::<Encoding>().copied().unwrap_or_default();

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => fut,
            Err(payload) => {
                let response = recovered(encoding, payload.as_ref());
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Ok(recovered(encoding, payload.as_ref())),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
