//! Server lifecycle state, in-flight tracking and shutdown signalling.
//!
//! Health state lives behind an `ArcSwap` so probes read it without locking.
//! In-flight requests are counted with RAII guards. Background work (backend
//! retry loops, the metrics listener) hangs off one `CancellationToken` that
//! is cancelled the moment shutdown begins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Server lifecycle state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Backends are connecting; the listener may not be bound yet.
    Starting,
    /// Accepting and serving requests.
    Ready,
    /// Shutdown signalled; finishing in-flight requests.
    Draining,
    /// Every in-flight request finished.
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

/// Coordinates readiness, in-flight accounting and shutdown.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    health_state: Arc<ArcSwap<HealthState>>,
    background: CancellationToken,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
            background: CancellationToken::new(),
        }
    }

    /// Moves `Starting` to `Ready`. Any later state is left alone, so a
    /// shutdown that raced startup keeps the probe failing.
    ///
    /// Returns whether the transition happened.
    pub fn set_ready(&self) -> bool {
        let previous = self.health_state.rcu(|current| {
            if **current == HealthState::Starting {
                Arc::new(HealthState::Ready)
            } else {
                Arc::clone(current)
            }
        });
        *previous == HealthState::Starting
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Parent token for background tasks. Cancelled by [`trigger_shutdown`].
    ///
    /// [`trigger_shutdown`]: Self::trigger_shutdown
    #[must_use]
    pub fn background_token(&self) -> &CancellationToken {
        &self.background
    }

    /// Moves to `Draining`, notifies receivers and cancels background tasks.
    ///
    /// Calling it more than once is harmless.
    pub fn trigger_shutdown(&self) {
        self.health_state.rcu(|current| {
            if **current == HealthState::Stopped {
                Arc::clone(current)
            } else {
                Arc::new(HealthState::Draining)
            }
        });
        self.background.cancel();
        // Receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Counts one in-flight request until the guard drops (panics included).
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until no request is in flight, at most `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on a clean drain; returns
    /// `false` and stays `Draining` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.health_state.store(Arc::new(HealthState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
