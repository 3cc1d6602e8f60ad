//! Time source port.

use chrono::{DateTime, Utc};

/// Wall-clock time as seen by the queue and lifecycle manager.
///
/// Lease expiry and audit timestamps read through this trait so tests can
/// move time forward explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
