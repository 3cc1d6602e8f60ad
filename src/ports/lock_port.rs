//! Session-scoped advisory lock primitive.

use crate::domain::error::LifecycleError;
use std::time::Duration;

/// One store session's view of a numeric advisory lock namespace.
///
/// Locks belong to the session that took them and vanish when the session
/// ends, whether or not `unlock` was called.
pub trait AdvisoryLockPort: Send + Sync {
    /// Non-blocking attempt. `Ok(false)` when another session holds the lock.
    fn try_lock(&self, lock_id: i64) -> Result<bool, LifecycleError>;

    /// Block up to `timeout`. `Ok(false)` on timeout; other failures are errors.
    fn lock_timeout(&self, lock_id: i64, timeout: Duration) -> Result<bool, LifecycleError>;

    /// `Ok(false)` when this session did not hold the lock.
    fn unlock(&self, lock_id: i64) -> Result<bool, LifecycleError>;
}
