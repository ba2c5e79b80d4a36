//! Connection resilience manager.
//!
//! Connects every configured backend once at startup. A backend that fails
//! gets its own background retry loop; loops are independent of each other and
//! of request traffic, and all of them stop when the manager's cancellation
//! token fires.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use gantry_core::Backend;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::descriptor::{BackendDescriptor, BackendHandle};
use super::state::ConnectionState;
use crate::network::recovery::panic_message;

/// Owns the connection state of every configured backend.
#[derive(Debug)]
pub struct ConnectionManager {
    /// In descriptor (initialization) order.
    states: Vec<Arc<ConnectionState>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// A manager with no backends.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            states: Vec::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attempts one connection per descriptor, in order, and spawns a retry
    /// loop for each backend that failed.
    ///
    /// Connection failures are logged, never returned: the runtime starts with
    /// whatever came up. Retry loops are cancelled by `shutdown()` or when
    /// `parent` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if two descriptors share a name.
    pub async fn initialize(
        descriptors: Vec<BackendDescriptor>,
        parent: &CancellationToken,
    ) -> anyhow::Result<Self> {
        {
            let mut seen = HashSet::new();
            for desc in &descriptors {
                if !seen.insert(desc.name()) {
                    anyhow::bail!("duplicate backend name: {}", desc.name());
                }
            }
        }

        let cancel = parent.child_token();
        let mut states = Vec::with_capacity(descriptors.len());
        let mut tasks = Vec::new();

        for desc in descriptors {
            let state = Arc::new(ConnectionState::new(desc.name()));
            state.mark_connecting();

            match attempt(&desc).await {
                Ok(handle) => {
                    state.mark_up(handle);
                    info!(backend = desc.name(), "backend connected");
                }
                Err(err) => {
                    error!(
                        backend = desc.name(),
                        error = %format!("{err:#}"),
                        retry_interval_ms = u64::try_from(desc.retry_policy().interval.as_millis())
                            .unwrap_or(u64::MAX),
                        "could not connect to backend, retrying in background"
                    );
                    state.mark_down(&err);
                    tasks.push(tokio::spawn(retry_loop(
                        desc,
                        Arc::clone(&state),
                        cancel.clone(),
                    )));
                }
            }

            states.push(state);
        }

        Ok(Self {
            states,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// All backend states in initialization order.
    #[must_use]
    pub fn states(&self) -> &[Arc<ConnectionState>] {
        &self.states
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<&Arc<ConnectionState>> {
        self.states.iter().find(|s| s.name() == name)
    }

    /// Returns the untyped handle of `name` if it is currently up.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<BackendHandle> {
        self.state(name)?.handle()
    }

    /// Returns the typed client of `name` if it is currently up.
    #[must_use]
    pub fn get<T: Backend>(&self, name: &str) -> Option<Arc<T>> {
        self.handle(name)?.downcast::<T>()
    }

    /// Number of retry loops still running.
    #[must_use]
    pub fn active_retries(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancels every retry loop and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!("backend retry loop panicked: {err}");
                }
            }
        }
    }
}

/// Runs one connection attempt. A panic inside the connect function counts
/// as a failed attempt.
async fn attempt(desc: &BackendDescriptor) -> anyhow::Result<BackendHandle> {
    let result = match std::panic::catch_unwind(AssertUnwindSafe(|| desc.connect())) {
        Ok(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "connect panicked: {}",
                    panic_message(payload.as_ref())
                ))
            }),
        Err(payload) => Err(anyhow::anyhow!(
            "connect panicked: {}",
            panic_message(payload.as_ref())
        )),
    };

    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(
        "app_backend_connect_attempts_total",
        "backend" => desc.name().to_string(),
        "outcome" => outcome,
    )
    .increment(1);

    result
}

/// Reconnects one backend until it comes up, the retry cap is reached, or
/// `cancel` fires.
async fn retry_loop(desc: BackendDescriptor, state: Arc<ConnectionState>, cancel: CancellationToken) {
    let policy = desc.retry_policy();
    let mut retries: u32 = 0;

    loop {
        if !policy.allows(retries) {
            error!(
                backend = desc.name(),
                retries, "giving up on backend, retry limit reached"
            );
            return;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(backend = desc.name(), "backend retry loop cancelled");
                return;
            }
            () = tokio::time::sleep(policy.interval) => {}
        }

        retries += 1;
        state.mark_connecting();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                state.mark_down(&anyhow::anyhow!("shutdown during connect"));
                return;
            }
            result = attempt(&desc) => result,
        };

        match result {
            Ok(handle) => {
                state.mark_up(handle);
                info!(backend = desc.name(), retries, "backend reconnected");
                return;
            }
            Err(err) => {
                warn!(
                    backend = desc.name(),
                    retries,
                    error = %format!("{err:#}"),
                    "backend reconnect failed"
                );
                state.mark_down(&err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use gantry_core::Status;

    use super::*;
    use crate::backend::state::Liveness;

    struct FakeDb {
        generation: u32,
    }

    #[async_trait]
    impl Backend for FakeDb {
        async fn health_check(&self) -> Status {
            Status::Up
        }
    }

    /// Descriptor whose connect fails `failures` times, then succeeds.
    fn flaky(name: &str, failures: u32, interval_ms: u64) -> (BackendDescriptor, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let desc = BackendDescriptor::new(name, move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    anyhow::bail!("attempt {n} refused");
                }
                Ok(FakeDb { generation: n })
            }
        })
        .with_retry_interval(Duration::from_millis(interval_ms));
        (desc, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_backends_come_up_without_retries() {
        let (a, _) = flaky("sql", 0, 100);
        let (b, _) = flaky("redis", 0, 100);
        let manager = ConnectionManager::initialize(vec![a, b], &CancellationToken::new())
            .await
            .unwrap();

        let names: Vec<_> = manager.states().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["sql", "redis"]);
        assert!(manager.states().iter().all(|s| s.liveness() == Liveness::Up));
        assert_eq!(manager.active_retries(), 0);
        assert_eq!(manager.get::<FakeDb>("sql").unwrap().generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_converges_after_exactly_k_retries() {
        const K: u32 = 3;
        // Startup attempt plus K - 1 failed retries, then success on retry K.
        let (desc, calls) = flaky("sql", K, 100);
        let manager = ConnectionManager::initialize(vec![desc], &CancellationToken::new())
            .await
            .unwrap();

        let state = Arc::clone(manager.state("sql").unwrap());
        assert_eq!(state.liveness(), Liveness::Down);
        assert!(manager.get::<FakeDb>("sql").is_none());

        tokio::time::sleep(Duration::from_millis(100 * u64::from(K - 1) + 50)).await;
        assert_eq!(state.liveness(), Liveness::Down);
        assert!(state.handle().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = state.snapshot();
        assert_eq!(snap.liveness, Liveness::Up);
        assert!(snap.handle.is_some());
        assert_eq!(snap.attempts, K + 1);
        assert_eq!(calls.load(Ordering::SeqCst), K + 1);
        assert_eq!(manager.get::<FakeDb>("sql").unwrap().generation, K + 1);
        assert_eq!(manager.active_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_backend_does_not_affect_others() {
        let (bad, _) = flaky("kafka", u32::MAX, 50);
        let (good, _) = flaky("redis", 0, 50);
        let manager = ConnectionManager::initialize(vec![bad, good], &CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.state("kafka").unwrap().liveness(), Liveness::Down);
        assert_eq!(manager.state("redis").unwrap().liveness(), Liveness::Up);
        assert_eq!(manager.active_retries(), 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_connect_counts_as_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let desc = BackendDescriptor::new("search", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                assert!(n > 2, "driver exploded on attempt {n}");
                Ok(FakeDb { generation: n })
            }
        })
        .with_retry_interval(Duration::from_millis(10));

        let manager = ConnectionManager::initialize(vec![desc], &CancellationToken::new())
            .await
            .unwrap();
        let state = manager.state("search").unwrap();
        assert_eq!(state.liveness(), Liveness::Down);
        assert!(state
            .snapshot()
            .last_error
            .as_deref()
            .unwrap()
            .contains("connect panicked"));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(state.liveness(), Liveness::Up);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn capped_policy_gives_up() {
        let (desc, calls) = flaky("mongo", u32::MAX, 10);
        let desc = desc.with_max_attempts(2);
        let manager = ConnectionManager::initialize(vec![desc], &CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state("mongo").unwrap().liveness(), Liveness::Down);
        assert_eq!(manager.active_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_retry_loops() {
        let (desc, calls) = flaky("cassandra", u32::MAX, 10);
        let manager = ConnectionManager::initialize(vec![desc], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manager.active_retries(), 1);

        manager.shutdown().await;
        assert_eq!(manager.active_retries(), 0);

        let after = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_retry_loops() {
        let parent = CancellationToken::new();
        let (desc, calls) = flaky("cassandra", u32::MAX, 10);
        let manager = ConnectionManager::initialize(vec![desc], &parent).await.unwrap();

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(15)).await;
        let after = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after);
        assert_eq!(manager.active_retries(), 0);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let (a, _) = flaky("sql", 0, 10);
        let (b, _) = flaky("sql", 0, 10);
        let err = ConnectionManager::initialize(vec![a, b], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate backend name"));
    }

    #[test]
    fn empty_manager_has_no_backends() {
        let manager = ConnectionManager::empty();
        assert!(manager.states().is_empty());
        assert!(manager.handle("sql").is_none());
    }
}
