//! Operation queue persistence port.
//!
//! Every state change is a single conditional statement; callers learn from
//! the returned flag whether their condition still held.

use crate::domain::error::LifecycleError;
use crate::domain::operation::{EnqueueRequest, Operation, OperationStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;

pub trait OperationStore: Send + Sync {
    /// Insert a pending operation. `Ok(None)` if the idempotency key exists.
    fn insert_if_absent(
        &self,
        request: &EnqueueRequest,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, LifecycleError>;

    fn find_by_key(&self, key: &str) -> Result<Option<Operation>, LifecycleError>;

    fn get(&self, id: i64) -> Result<Option<Operation>, LifecycleError>;

    /// Highest priority, then oldest, among pending and lease-expired in-progress.
    fn next_candidate(&self, now: DateTime<Utc>) -> Result<Option<i64>, LifecycleError>;

    /// Compare-and-swap to `in_progress` with a lease ending at `lease_until`.
    fn claim(
        &self,
        id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, LifecycleError>;

    /// Only from `pending` or `in_progress`. `Ok(false)` when the operation
    /// is already terminal.
    fn complete(&self, id: i64, result: &Value, now: DateTime<Utc>) -> Result<bool, LifecycleError>;

    /// Increment the retry count and move to `pending` or terminal `failed`.
    /// `Ok(None)` when the operation is not pending or in progress.
    fn record_failure(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OperationStatus>, LifecycleError>;

    /// Pending only.
    fn cancel(&self, id: i64, now: DateTime<Utc>) -> Result<bool, LifecycleError>;

    /// Reset expired in-progress leases to pending.
    fn release_expired(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError>;

    fn list(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>, LifecycleError>;
}
