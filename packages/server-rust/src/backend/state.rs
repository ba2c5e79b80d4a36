//! Per-backend connection state.
//!
//! Each backend's state is published as an immutable [`ConnectionSnapshot`]
//! behind an `ArcSwap`. The manager is the only writer and replaces the whole
//! snapshot with one pointer store, so readers never see a liveness that
//! disagrees with the handle next to it.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use gantry_core::{HealthProbe, Status};

use super::descriptor::BackendHandle;

/// Whether a backend handle is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// A connection attempt is in progress.
    Connecting,
    /// Connected; the snapshot carries a handle.
    Up,
    /// The last attempt failed.
    Down,
}

impl Liveness {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Liveness::Connecting => "connecting",
            Liveness::Up => "up",
            Liveness::Down => "down",
        }
    }
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub liveness: Liveness,
    /// Present if and only if `liveness` is `Up`.
    pub handle: Option<BackendHandle>,
    pub last_error: Option<String>,
    /// Connection attempts made so far, including the startup attempt.
    pub attempts: u32,
}

/// Shared, lock-free state of one backend.
#[derive(Debug)]
pub struct ConnectionState {
    name: Arc<str>,
    snapshot: ArcSwap<ConnectionSnapshot>,
}

impl ConnectionState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            snapshot: ArcSwap::from_pointee(ConnectionSnapshot {
                liveness: Liveness::Connecting,
                handle: None,
                last_error: None,
                attempts: 0,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.snapshot.load_full()
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.snapshot.load().liveness
    }

    /// Returns the handle, or `None` while the backend is not `Up`.
    #[must_use]
    pub fn handle(&self) -> Option<BackendHandle> {
        self.snapshot.load().handle.clone()
    }

    /// Records the start of a connection attempt.
    pub(crate) fn mark_connecting(&self) {
        let prev = self.snapshot.load();
        self.snapshot.store(Arc::new(ConnectionSnapshot {
            liveness: Liveness::Connecting,
            handle: None,
            last_error: prev.last_error.clone(),
            attempts: prev.attempts + 1,
        }));
    }

    pub(crate) fn mark_up(&self, handle: BackendHandle) {
        let attempts = self.snapshot.load().attempts;
        self.snapshot.store(Arc::new(ConnectionSnapshot {
            liveness: Liveness::Up,
            handle: Some(handle),
            last_error: None,
            attempts,
        }));
        metrics::gauge!("app_backend_up", "backend" => self.name.to_string()).set(1.0);
    }

    pub(crate) fn mark_down(&self, err: &anyhow::Error) {
        let attempts = self.snapshot.load().attempts;
        self.snapshot.store(Arc::new(ConnectionSnapshot {
            liveness: Liveness::Down,
            handle: None,
            last_error: Some(format!("{err:#}")),
            attempts,
        }));
        metrics::gauge!("app_backend_up", "backend" => self.name.to_string()).set(0.0);
    }
}

#[async_trait]
impl HealthProbe for ConnectionState {
    /// A backend without a handle is down; otherwise the backend decides.
    async fn check(&self) -> Status {
        match self.handle() {
            Some(handle) => handle.health_check().await,
            None => Status::Down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Backend;

    struct Up;

    #[async_trait]
    impl Backend for Up {
        async fn health_check(&self) -> Status {
            Status::Up
        }
    }

    #[test]
    fn starts_connecting_without_handle() {
        let state = ConnectionState::new("sql");
        assert_eq!(state.name(), "sql");
        assert_eq!(state.liveness(), Liveness::Connecting);
        assert!(state.handle().is_none());
        assert_eq!(state.snapshot().attempts, 0);
    }

    #[test]
    fn transitions_keep_handle_and_liveness_consistent() {
        let state = ConnectionState::new("sql");

        state.mark_connecting();
        state.mark_down(&anyhow::anyhow!("refused"));
        let snap = state.snapshot();
        assert_eq!(snap.liveness, Liveness::Down);
        assert!(snap.handle.is_none());
        assert_eq!(snap.last_error.as_deref(), Some("refused"));
        assert_eq!(snap.attempts, 1);

        state.mark_connecting();
        assert_eq!(state.snapshot().last_error.as_deref(), Some("refused"));
        state.mark_up(BackendHandle::new(Up));
        let snap = state.snapshot();
        assert_eq!(snap.liveness, Liveness::Up);
        assert!(snap.handle.is_some());
        assert!(snap.last_error.is_none());
        assert_eq!(snap.attempts, 2);
    }

    #[tokio::test]
    async fn health_follows_handle() {
        let state = ConnectionState::new("sql");
        assert_eq!(state.check().await, Status::Down);

        state.mark_connecting();
        state.mark_up(BackendHandle::new(Up));
        assert_eq!(state.check().await, Status::Up);
    }
}
