//! Append-only audit log.

use crate::domain::audit::AuditEvent;
use crate::domain::error::LifecycleError;

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), LifecycleError>;
}
