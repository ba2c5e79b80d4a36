//! Health value types and the reduction from per-backend status to one
//! overall status.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Liveness reported by a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
        }
    }
}

/// Composite status across all registered checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Up,
    Degraded,
    Down,
}

impl OverallStatus {
    /// Reduces individual statuses to one.
    ///
    /// All `Up` (including none at all) gives `Up`, all `Down` gives `Down`,
    /// any mix gives `Degraded`.
    pub fn reduce<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = Status>,
    {
        let (mut up, mut down) = (0usize, 0usize);
        for status in statuses {
            match status {
                Status::Up => up += 1,
                Status::Down => down += 1,
            }
        }

        match (up, down) {
            (_, 0) => OverallStatus::Up,
            (0, _) => OverallStatus::Down,
            _ => OverallStatus::Degraded,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Up => "UP",
            OverallStatus::Degraded => "DEGRADED",
            OverallStatus::Down => "DOWN",
        }
    }
}

/// Result of one aggregation pass. Derived on every request, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallHealth {
    pub status: OverallStatus,
    pub details: BTreeMap<String, Status>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_registry_is_up() {
        assert_eq!(OverallStatus::reduce(Vec::new()), OverallStatus::Up);
    }

    #[test]
    fn serializes_uppercase() {
        let health = OverallHealth {
            status: OverallStatus::Degraded,
            details: BTreeMap::from([
                ("redis".to_string(), Status::Up),
                ("sql".to_string(), Status::Down),
            ]),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "DEGRADED");
        assert_eq!(json["details"]["redis"], "UP");
        assert_eq!(json["details"]["sql"], "DOWN");
    }

    fn status_strategy() -> impl Strategy<Value = Status> {
        prop_oneof![Just(Status::Up), Just(Status::Down)]
    }

    proptest! {
        #[test]
        fn reduction_law(statuses in proptest::collection::vec(status_strategy(), 0..32)) {
            let all_up = statuses.iter().all(|s| *s == Status::Up);
            let all_down = !statuses.is_empty() && statuses.iter().all(|s| *s == Status::Down);

            let overall = OverallStatus::reduce(statuses.iter().copied());

            prop_assert_eq!(overall == OverallStatus::Up, all_up);
            prop_assert_eq!(overall == OverallStatus::Down, all_down);
            prop_assert_eq!(overall == OverallStatus::Degraded, !all_up && !all_down);
        }
    }
}
