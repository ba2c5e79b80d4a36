//! Backend connection descriptors.
//!
//! A descriptor names a backend, knows how to connect to it, and carries the
//! retry policy used when the connection is not available. Descriptors are
//! immutable once built.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{Backend, Status};

/// Boxed `Send` future, used wherever the runtime type-erases async callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ConnectFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<BackendHandle>> + Send + Sync>;

/// Default pause between reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// BackendHandle
// ---------------------------------------------------------------------------

/// A connected backend.
///
/// Holds the same allocation twice: as `dyn Backend` for health checks and as
/// `dyn Any` so request handlers can recover the concrete client type.
#[derive(Clone)]
pub struct BackendHandle {
    backend: Arc<dyn Backend>,
    any: Arc<dyn Any + Send + Sync>,
}

impl BackendHandle {
    pub fn new<T: Backend>(backend: T) -> Self {
        let backend = Arc::new(backend);
        Self {
            backend: backend.clone(),
            any: backend,
        }
    }

    /// Returns the concrete backend if it is a `T`.
    #[must_use]
    pub fn downcast<T: Backend>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }

    pub async fn health_check(&self) -> Status {
        self.backend.health_check().await
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How a backend that failed to connect is retried.
///
/// The default retries forever at a fixed interval. `max_attempts` caps the
/// number of background retries (the initial startup attempt is not counted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another retry is allowed after `retries` have already run.
    #[must_use]
    pub fn allows(&self, retries: u32) -> bool {
        self.max_attempts.map_or(true, |max| retries < max)
    }
}

// ---------------------------------------------------------------------------
// BackendDescriptor
// ---------------------------------------------------------------------------

/// Names a backend and how to connect to it.
#[derive(Clone)]
pub struct BackendDescriptor {
    name: Arc<str>,
    connect: ConnectFn,
    retry: RetryPolicy,
}

impl BackendDescriptor {
    /// Creates a descriptor from an async connect function.
    ///
    /// `connect` is called once at startup and again on every retry; it must
    /// build a fresh client each time.
    pub fn new<T, F, Fut>(name: impl Into<String>, connect: F) -> Self
    where
        T: Backend,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let connect: ConnectFn = Arc::new(move || {
            let fut = connect();
            Box::pin(async move { fut.await.map(BackendHandle::new) })
        });

        Self {
            name: Arc::from(name.into()),
            connect,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry.interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Starts one connection attempt.
    #[must_use]
    pub fn connect(&self) -> BoxFuture<'static, anyhow::Result<BackendHandle>> {
        (self.connect)()
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Cache {
        url: String,
    }

    #[async_trait]
    impl Backend for Cache {
        async fn health_check(&self) -> Status {
            Status::Up
        }
    }

    struct Other;

    #[async_trait]
    impl Backend for Other {
        async fn health_check(&self) -> Status {
            Status::Down
        }
    }

    #[test]
    fn retry_policy_defaults_to_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval, DEFAULT_RETRY_INTERVAL);
        assert!(policy.max_attempts.is_none());
        assert!(policy.allows(u32::MAX - 1));
    }

    #[test]
    fn capped_policy_stops_allowing() {
        let policy = RetryPolicy {
            interval: Duration::from_millis(5),
            max_attempts: Some(2),
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn builder_sets_policy() {
        let desc = BackendDescriptor::new("redis", || async {
            Ok(Cache {
                url: "redis://localhost".to_string(),
            })
        })
        .with_retry_interval(Duration::from_millis(100))
        .with_max_attempts(3);

        assert_eq!(desc.name(), "redis");
        assert_eq!(desc.retry_policy().interval, Duration::from_millis(100));
        assert_eq!(desc.retry_policy().max_attempts, Some(3));
    }

    #[tokio::test]
    async fn connect_produces_downcastable_handle() {
        let desc = BackendDescriptor::new("redis", || async {
            Ok(Cache {
                url: "redis://localhost".to_string(),
            })
        });

        let handle = desc.connect().await.unwrap();
        let cache = handle.downcast::<Cache>().expect("concrete type");
        assert_eq!(cache.url, "redis://localhost");
        assert!(handle.downcast::<Other>().is_none());
        assert_eq!(handle.health_check().await, Status::Up);
    }
}
