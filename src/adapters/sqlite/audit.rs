use super::{SqliteAdapter, query_err, to_ms};
use crate::domain::audit::AuditEvent;
use crate::domain::error::LifecycleError;
use crate::ports::audit_port::AuditSink;
use rusqlite::params;

/// A stored audit row, flattened for display.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRow {
    pub strategy_id: Option<i64>,
    pub kind: String,
    pub message: String,
    pub metadata: String,
    pub at_ms: i64,
}

impl AuditSink for SqliteAdapter {
    fn record(&self, event: &AuditEvent) -> Result<(), LifecycleError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        self.conn()?
            .execute(
                "INSERT INTO audit_log (strategy_id, kind, message, metadata, at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.strategy_id,
                    event.kind.as_str(),
                    event.message,
                    metadata,
                    to_ms(event.at)
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }
}

impl SqliteAdapter {
    /// Most recent audit rows for a strategy, newest first.
    pub fn recent_audit(&self, strategy_id: i64, limit: usize) -> Result<Vec<AuditRow>, LifecycleError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT strategy_id, kind, message, metadata, at FROM audit_log
                 WHERE strategy_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![strategy_id, limit as i64], |row| {
                Ok(AuditRow {
                    strategy_id: row.get(0)?,
                    kind: row.get(1)?,
                    message: row.get(2)?,
                    metadata: row.get(3)?,
                    at_ms: row.get(4)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(query_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::AuditKind;
    use chrono::DateTime;

    #[test]
    fn record_and_read_back() {
        let store = SqliteAdapter::in_memory().unwrap();
        store.initialize_schema().unwrap();
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        store
            .record(&AuditEvent::new(Some(3), AuditKind::Transition, "WAITING -> ARMED", at))
            .unwrap();
        store
            .record(
                &AuditEvent::new(Some(3), AuditKind::GuardRejected, "max_quantity", at)
                    .with("requested", 50.0),
            )
            .unwrap();
        let rows = store.recent_audit(3, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "guard_rejected");
        assert!(rows[0].metadata.contains("requested"));
        assert_eq!(rows[1].message, "WAITING -> ARMED");
    }
}
