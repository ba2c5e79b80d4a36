use async_trait::async_trait;

use crate::health::Status;

/// A connected backend handle (SQL pool, cache client, broker producer, ...).
///
/// The runtime never looks inside a backend: it only obtains one through the
/// descriptor's connect function and asks it for its health. Backends own their
/// wire protocol entirely.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Reports whether the underlying connection is currently usable.
    async fn health_check(&self) -> Status;
}

/// Health probe for something that is not a connected backend, e.g. a disk
/// watermark or an upstream HTTP dependency.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self) -> Status;
}

#[async_trait]
impl<B: Backend> HealthProbe for B {
    async fn check(&self) -> Status {
        self.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky(bool);

    #[async_trait]
    impl Backend for Flaky {
        async fn health_check(&self) -> Status {
            if self.0 {
                Status::Up
            } else {
                Status::Down
            }
        }
    }

    #[tokio::test]
    async fn backends_are_health_probes() {
        assert_eq!(Flaky(true).check().await, Status::Up);
        assert_eq!(Flaky(false).check().await, Status::Down);
    }
}
