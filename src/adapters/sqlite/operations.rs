use super::{SqliteAdapter, from_ms, from_ms_opt, json_column, query_err, to_ms};
use crate::domain::error::LifecycleError;
use crate::domain::operation::{
    EnqueueRequest, Operation, OperationStatus, PayloadEnvelope,
};
use crate::ports::operation_store_port::OperationStore;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

const COLUMNS: &str = "id, idempotency_key, op_type, symbol, strategy_id, priority, payload, \
                       status, retry_count, max_retries, result, error, created_at, updated_at, \
                       lease_expires_at";

#[derive(Debug)]
struct UnknownStatus(String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown operation status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

fn map_operation(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let payload_text: String = row.get(6)?;
    let envelope: PayloadEnvelope = json_column(6, &payload_text)?;
    let status_text: String = row.get(7)?;
    let status = OperationStatus::parse(&status_text)
        .ok_or_else(|| super::conversion_err(7, UnknownStatus(status_text.clone())))?;
    let result_text: Option<String> = row.get(10)?;
    let result = result_text
        .map(|text| json_column::<Value>(10, &text))
        .transpose()?;
    Ok(Operation {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        op_type: row.get(2)?,
        symbol: row.get(3)?,
        strategy_id: row.get(4)?,
        priority: row.get(5)?,
        payload: envelope.payload,
        metadata: envelope.metadata,
        status,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        result,
        error: row.get(11)?,
        created_at: from_ms(12, row.get(12)?)?,
        updated_at: from_ms(13, row.get(13)?)?,
        lease_expires_at: from_ms_opt(14, row.get(14)?)?,
    })
}

impl OperationStore for SqliteAdapter {
    fn insert_if_absent(
        &self,
        request: &EnqueueRequest,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, LifecycleError> {
        let payload = serde_json::to_string(&request.envelope())?;
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT INTO operations (idempotency_key, op_type, symbol, strategy_id, priority,
                                         payload, status, retry_count, max_retries,
                                         created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?8)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                params![
                    request.idempotency_key,
                    request.payload.kind(),
                    request.symbol,
                    request.payload.strategy_id(),
                    request.priority,
                    payload,
                    max_retries,
                    to_ms(now),
                ],
            )
            .map_err(query_err)?;
        Ok((inserted == 1).then(|| conn.last_insert_rowid()))
    }

    fn find_by_key(&self, key: &str) -> Result<Option<Operation>, LifecycleError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM operations WHERE idempotency_key = ?1"),
            params![key],
            map_operation,
        )
        .optional()
        .map_err(query_err)
    }

    fn get(&self, id: i64) -> Result<Option<Operation>, LifecycleError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM operations WHERE id = ?1"),
            params![id],
            map_operation,
        )
        .optional()
        .map_err(query_err)
    }

    fn next_candidate(&self, now: DateTime<Utc>) -> Result<Option<i64>, LifecycleError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id FROM operations
             WHERE status = 'pending'
                OR (status = 'in_progress' AND lease_expires_at <= ?1)
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT 1",
            params![to_ms(now)],
            |row| row.get(0),
        )
        .optional()
        .map_err(query_err)
    }

    fn claim(
        &self,
        id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE operations
                 SET status = 'in_progress', lease_expires_at = ?3, updated_at = ?2
                 WHERE id = ?1
                   AND (status = 'pending'
                        OR (status = 'in_progress' AND lease_expires_at <= ?2))",
                params![id, to_ms(now), to_ms(lease_until)],
            )
            .map_err(query_err)?;
        Ok(updated == 1)
    }

    fn complete(&self, id: i64, result: &Value, now: DateTime<Utc>) -> Result<bool, LifecycleError> {
        let result_text = serde_json::to_string(result)?;
        let updated = self
            .conn()?
            .execute(
                "UPDATE operations
                 SET status = 'completed', result = ?2, error = NULL,
                     lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'in_progress')",
                params![id, result_text, to_ms(now)],
            )
            .map_err(query_err)?;
        Ok(updated == 1)
    }

    fn record_failure(
        &self,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<OperationStatus>, LifecycleError> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "UPDATE operations
                 SET retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 < max_retries
                                   THEN 'pending' ELSE 'failed' END,
                     error = ?2, lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status IN ('pending', 'in_progress')
                 RETURNING status",
                params![id, error, to_ms(now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(query_err)?;
        Ok(status.as_deref().and_then(OperationStatus::parse))
    }

    fn cancel(&self, id: i64, now: DateTime<Utc>) -> Result<bool, LifecycleError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE operations SET status = 'cancelled', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, to_ms(now)],
            )
            .map_err(query_err)?;
        Ok(updated == 1)
    }

    fn release_expired(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        self.conn()?
            .execute(
                "UPDATE operations SET status = 'pending', lease_expires_at = NULL, updated_at = ?1
                 WHERE status = 'in_progress' AND lease_expires_at <= ?1",
                params![to_ms(now)],
            )
            .map_err(query_err)
    }

    fn list(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>, LifecycleError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM operations
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY id ASC"
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], map_operation)
            .map_err(query_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(query_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationPayload;
    use chrono::Duration;

    fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        adapter
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn request(key: &str) -> EnqueueRequest {
        EnqueueRequest::new(
            key,
            OperationPayload::Close {
                strategy_id: 4,
                reason: "test".into(),
            },
        )
        .with_symbol("SPY")
    }

    #[test]
    fn insert_conflict_returns_none() {
        let store = adapter();
        let id = store.insert_if_absent(&request("a"), 3, t0()).unwrap();
        assert!(id.is_some());
        assert_eq!(store.insert_if_absent(&request("a"), 3, t0()).unwrap(), None);
        let op = store.find_by_key("a").unwrap().unwrap();
        assert_eq!(Some(op.id), id);
        assert_eq!(op.op_type, "close");
        assert_eq!(op.strategy_id, Some(4));
        assert_eq!(op.symbol.as_deref(), Some("SPY"));
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn claim_is_compare_and_swap() {
        let store = adapter();
        let id = store.insert_if_absent(&request("a"), 3, t0()).unwrap().unwrap();
        let lease = t0() + Duration::seconds(300);
        assert!(store.claim(id, t0(), lease).unwrap());
        assert!(!store.claim(id, t0(), lease).unwrap());
        assert!(!store.claim(id, lease - Duration::milliseconds(1), lease).unwrap());
        assert!(store.claim(id, lease, lease + Duration::seconds(300)).unwrap());
    }

    #[test]
    fn record_failure_counts_down_to_terminal() {
        let store = adapter();
        let id = store.insert_if_absent(&request("a"), 2, t0()).unwrap().unwrap();
        assert_eq!(
            store.record_failure(id, "first", t0()).unwrap(),
            Some(OperationStatus::Pending)
        );
        assert_eq!(
            store.record_failure(id, "second", t0()).unwrap(),
            Some(OperationStatus::Failed)
        );
        assert_eq!(store.record_failure(id, "third", t0()).unwrap(), None);
        let op = store.get(id).unwrap().unwrap();
        assert_eq!(op.retry_count, 2);
        assert_eq!(op.error.as_deref(), Some("second"));
    }

    #[test]
    fn complete_stores_result_once() {
        let store = adapter();
        let id = store.insert_if_absent(&request("a"), 3, t0()).unwrap().unwrap();
        assert!(store.complete(id, &serde_json::json!({"ok": 1}), t0()).unwrap());
        assert!(!store.complete(id, &serde_json::json!({"ok": 2}), t0()).unwrap());
        let op = store.get(id).unwrap().unwrap();
        assert_eq!(op.result, Some(serde_json::json!({"ok": 1})));
    }

    #[test]
    fn terminal_failure_cannot_be_completed() {
        let store = adapter();
        let id = store.insert_if_absent(&request("a"), 1, t0()).unwrap().unwrap();
        assert_eq!(
            store.record_failure(id, "gone", t0()).unwrap(),
            Some(OperationStatus::Failed)
        );
        assert!(!store.complete(id, &serde_json::json!({"ok": 1}), t0()).unwrap());
        let op = store.get(id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.result, None);
    }

    #[test]
    fn list_filters_by_status() {
        let store = adapter();
        let a = store.insert_if_absent(&request("a"), 3, t0()).unwrap().unwrap();
        store.insert_if_absent(&request("b"), 3, t0()).unwrap();
        assert!(store.cancel(a, t0()).unwrap());
        assert_eq!(store.list(None).unwrap().len(), 2);
        let cancelled = store.list(Some(OperationStatus::Cancelled)).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a);
    }
}
