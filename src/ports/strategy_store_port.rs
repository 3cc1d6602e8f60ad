//! Strategy persistence port.

use crate::domain::error::LifecycleError;
use crate::domain::strategy::{NewStrategy, Strategy, StrategyStatus};
use chrono::{DateTime, Utc};

pub trait StrategyStore: Send + Sync {
    /// Insert a draft. `lineage` links a new version to an existing strategy;
    /// the version number is one past the highest in that lineage.
    fn insert(
        &self,
        strategy: &NewStrategy,
        lineage: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Strategy, LifecycleError>;

    fn get(&self, id: i64) -> Result<Option<Strategy>, LifecycleError>;

    fn list_by_status(&self, status: StrategyStatus) -> Result<Vec<Strategy>, LifecycleError>;

    /// All versions sharing a lineage, oldest first.
    fn versions(&self, lineage_id: i64) -> Result<Vec<Strategy>, LifecycleError>;

    /// Moving to `Active` stamps `activated_at`.
    fn set_status(
        &self,
        id: i64,
        status: StrategyStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError>;

    fn close(&self, id: i64, reason: &str, now: DateTime<Utc>) -> Result<(), LifecycleError>;

    fn save_snapshot(&self, id: i64, snapshot: &serde_json::Value) -> Result<(), LifecycleError>;
}
