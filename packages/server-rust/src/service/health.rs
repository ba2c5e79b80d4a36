//! Health aggregation across backends and custom probes.

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::{HealthProbe, OverallHealth, OverallStatus};

use crate::backend::ConnectionManager;

/// Ordered list of named health checks.
///
/// Built during startup (backends first, in initialization order, then any
/// probes the application adds) and frozen behind an `Arc` once the server
/// boots; there is no way to add or remove checks afterwards.
#[derive(Default)]
pub struct HealthRegistry {
    checks: Vec<(String, Arc<dyn HealthProbe>)>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one check per backend known to `manager`.
    #[must_use]
    pub fn from_backends(manager: &ConnectionManager) -> Self {
        let mut registry = Self::new();
        for state in manager.states() {
            let probe: Arc<dyn HealthProbe> = Arc::clone(state) as Arc<dyn HealthProbe>;
            registry.register(state.name(), probe);
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        self.checks.push((name.into(), probe));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.checks.iter().map(|(name, _)| name.as_str())
    }

    /// Runs every check in registration order and reduces the results.
    ///
    /// Holds no locks and mutates nothing, so concurrent callers are fine.
    pub async fn aggregate(&self) -> OverallHealth {
        let mut statuses = Vec::with_capacity(self.checks.len());
        let mut details = BTreeMap::new();

        for (name, probe) in &self.checks {
            let status = probe.check().await;
            statuses.push(status);
            details.insert(name.clone(), status);
        }

        OverallHealth {
            status: OverallStatus::reduce(statuses),
            details,
        }
    }
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("checks", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use gantry_core::Status;

    use super::*;

    struct Fixed(Status);

    #[async_trait]
    impl HealthProbe for Fixed {
        async fn check(&self) -> Status {
            self.0
        }
    }

    fn registry(statuses: &[Status]) -> HealthRegistry {
        let mut registry = HealthRegistry::new();
        for (i, status) in statuses.iter().enumerate() {
            registry.register(format!("b{i}"), Arc::new(Fixed(*status)));
        }
        registry
    }

    #[tokio::test]
    async fn empty_registry_is_up() {
        let health = HealthRegistry::new().aggregate().await;
        assert_eq!(health.status, OverallStatus::Up);
        assert!(health.details.is_empty());
    }

    #[tokio::test]
    async fn all_up_is_up() {
        let health = registry(&[Status::Up, Status::Up]).aggregate().await;
        assert_eq!(health.status, OverallStatus::Up);
    }

    #[tokio::test]
    async fn all_down_is_down() {
        let health = registry(&[Status::Down, Status::Down, Status::Down])
            .aggregate()
            .await;
        assert_eq!(health.status, OverallStatus::Down);
        assert_eq!(health.details.len(), 3);
    }

    #[tokio::test]
    async fn mix_is_degraded() {
        let health = registry(&[Status::Up, Status::Down]).aggregate().await;
        assert_eq!(health.status, OverallStatus::Degraded);
        assert_eq!(health.details["b0"], Status::Up);
        assert_eq!(health.details["b1"], Status::Down);
    }

    #[test]
    fn preserves_registration_order() {
        let mut registry = HealthRegistry::new();
        registry.register("sql", Arc::new(Fixed(Status::Up)));
        registry.register("redis", Arc::new(Fixed(Status::Up)));
        registry.register("disk", Arc::new(Fixed(Status::Up)));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["sql", "redis", "disk"]);
    }

    #[tokio::test]
    async fn backends_without_handle_report_down() {
        use crate::backend::BackendDescriptor;
        use tokio_util::sync::CancellationToken;

        struct Never;
        #[async_trait]
        impl gantry_core::Backend for Never {
            async fn health_check(&self) -> Status {
                Status::Up
            }
        }

        let desc = BackendDescriptor::new("sql", || async {
            Err::<Never, _>(anyhow::anyhow!("refused"))
        });
        let cancel = CancellationToken::new();
        let manager = ConnectionManager::initialize(vec![desc], &cancel).await.unwrap();

        let health = HealthRegistry::from_backends(&manager).aggregate().await;
        assert_eq!(health.status, OverallStatus::Down);
        assert_eq!(health.details["sql"], Status::Down);

        manager.shutdown().await;
    }
}
