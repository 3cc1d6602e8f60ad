//! Audit sink that writes events to the log instead of a table.

use crate::domain::audit::AuditEvent;
use crate::domain::error::LifecycleError;
use crate::ports::audit_port::AuditSink;
use log::info;
use std::sync::Mutex;

#[derive(Default)]
pub struct LogAuditSink {
    counts: Mutex<Vec<(String, usize)>>,
}

impl LogAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far per kind, in first-seen order.
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for LogAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), LifecycleError> {
        let kind = event.kind.as_str();
        match event.strategy_id {
            Some(id) => info!("audit {kind} [strategy {id}] {}", event.message),
            None => info!("audit {kind} {}", event.message),
        }
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match counts.iter_mut().find(|(k, _)| k == kind) {
            Some((_, n)) => *n += 1,
            None => counts.push((kind.to_string(), 1)),
        }
        Ok(())
    }
}
