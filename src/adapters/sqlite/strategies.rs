use super::{SqliteAdapter, conversion_err, from_ms, from_ms_opt, json_column, query_err, to_ms};
use crate::domain::error::LifecycleError;
use crate::domain::strategy::{NewStrategy, Strategy, StrategyStatus};
use crate::ports::strategy_store_port::StrategyStore;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

const COLUMNS: &str = "id, lineage_id, version, name, owner, symbol, timeframe, status, program, \
                       activated_at, closed_at, close_reason, runtime_snapshot, created_at";

#[derive(Debug)]
struct UnknownStatus(String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown strategy status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

fn map_strategy(row: &Row<'_>) -> rusqlite::Result<Strategy> {
    let status_text: String = row.get(7)?;
    let status = StrategyStatus::parse(&status_text)
        .ok_or_else(|| conversion_err(7, UnknownStatus(status_text.clone())))?;
    let program_text: String = row.get(8)?;
    let snapshot_text: Option<String> = row.get(12)?;
    Ok(Strategy {
        id: row.get(0)?,
        lineage_id: row.get(1)?,
        version: row.get(2)?,
        name: row.get(3)?,
        owner: row.get(4)?,
        symbol: row.get(5)?,
        timeframe: row.get(6)?,
        status,
        program: json_column(8, &program_text)?,
        activated_at: from_ms_opt(9, row.get(9)?)?,
        closed_at: from_ms_opt(10, row.get(10)?)?,
        close_reason: row.get(11)?,
        runtime_snapshot: snapshot_text
            .map(|text| json_column(12, &text))
            .transpose()?,
        created_at: from_ms(13, row.get(13)?)?,
    })
}

impl SqliteAdapter {
    fn fetch_strategy(&self, id: i64) -> Result<Option<Strategy>, LifecycleError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM strategies WHERE id = ?1"),
            params![id],
            map_strategy,
        )
        .optional()
        .map_err(query_err)
    }

    fn query_strategies(
        &self,
        filter: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<Strategy>, LifecycleError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM strategies WHERE {filter} ORDER BY id ASC"
            ))
            .map_err(query_err)?;
        let rows = stmt.query_map(&[param], map_strategy).map_err(query_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(query_err)
    }
}

impl StrategyStore for SqliteAdapter {
    fn insert(
        &self,
        strategy: &NewStrategy,
        lineage: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Strategy, LifecycleError> {
        let program = serde_json::to_string(&strategy.program)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        let version: i64 = match lineage {
            Some(lineage_id) => tx
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM strategies WHERE lineage_id = ?1",
                    params![lineage_id],
                    |row| row.get(0),
                )
                .map_err(query_err)?,
            None => 1,
        };
        tx.execute(
            "INSERT INTO strategies (lineage_id, version, name, owner, symbol, timeframe,
                                     status, program, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                lineage,
                version,
                strategy.name,
                strategy.owner,
                strategy.symbol,
                strategy.timeframe,
                StrategyStatus::Draft.as_str(),
                program,
                to_ms(now),
            ],
        )
        .map_err(query_err)?;
        let id = tx.last_insert_rowid();
        if lineage.is_none() {
            tx.execute(
                "UPDATE strategies SET lineage_id = id WHERE id = ?1",
                params![id],
            )
            .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)?;
        drop(conn);

        self.fetch_strategy(id)?
            .ok_or(LifecycleError::StrategyNotFound { id })
    }

    fn get(&self, id: i64) -> Result<Option<Strategy>, LifecycleError> {
        self.fetch_strategy(id)
    }

    fn list_by_status(&self, status: StrategyStatus) -> Result<Vec<Strategy>, LifecycleError> {
        self.query_strategies("status = ?1", &status.as_str())
    }

    fn versions(&self, lineage_id: i64) -> Result<Vec<Strategy>, LifecycleError> {
        self.query_strategies("lineage_id = ?1", &lineage_id)
    }

    fn set_status(
        &self,
        id: i64,
        status: StrategyStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE strategies
                 SET status = ?2,
                     activated_at = CASE WHEN ?2 = 'active' THEN ?3 ELSE activated_at END
                 WHERE id = ?1",
                params![id, status.as_str(), to_ms(now)],
            )
            .map_err(query_err)?;
        if updated == 0 {
            return Err(LifecycleError::StrategyNotFound { id });
        }
        Ok(())
    }

    fn close(&self, id: i64, reason: &str, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE strategies SET status = 'closed', closed_at = ?2, close_reason = ?3
                 WHERE id = ?1",
                params![id, to_ms(now), reason],
            )
            .map_err(query_err)?;
        if updated == 0 {
            return Err(LifecycleError::StrategyNotFound { id });
        }
        Ok(())
    }

    fn save_snapshot(&self, id: i64, snapshot: &serde_json::Value) -> Result<(), LifecycleError> {
        let text = serde_json::to_string(snapshot)?;
        self.conn()?
            .execute(
                "UPDATE strategies SET runtime_snapshot = ?2 WHERE id = ?1",
                params![id, text],
            )
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::program::StrategyProgram;

    fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        adapter
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn new_strategy() -> NewStrategy {
        NewStrategy {
            name: "Breakout".into(),
            owner: "alice".into(),
            symbol: "SPY".into(),
            timeframe: "1m".into(),
            program: StrategyProgram {
                states: vec!["WAITING".into()],
                initial_state: "WAITING".into(),
                features: vec![],
                transitions: vec![],
                history_limit: 50,
            },
        }
    }

    #[test]
    fn insert_starts_new_lineage() {
        let store = adapter();
        let s = store.insert(&new_strategy(), None, now()).unwrap();
        assert_eq!(s.lineage_id, s.id);
        assert_eq!(s.version, 1);
        assert_eq!(s.status, StrategyStatus::Draft);
        assert_eq!(s.program.history_limit, 50);
    }

    #[test]
    fn versions_share_lineage() {
        let store = adapter();
        let v1 = store.insert(&new_strategy(), None, now()).unwrap();
        let v2 = store.insert(&new_strategy(), Some(v1.lineage_id), now()).unwrap();
        let v3 = store.insert(&new_strategy(), Some(v1.lineage_id), now()).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v3.version, 3);
        let versions = store.versions(v1.lineage_id).unwrap();
        assert_eq!(
            versions.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![v1.id, v2.id, v3.id]
        );
    }

    #[test]
    fn activation_and_close_are_stamped() {
        let store = adapter();
        let s = store.insert(&new_strategy(), None, now()).unwrap();
        store.set_status(s.id, StrategyStatus::Active, now()).unwrap();
        assert_eq!(store.list_by_status(StrategyStatus::Active).unwrap().len(), 1);
        store.close(s.id, "replaced", now()).unwrap();
        let closed = store.get(s.id).unwrap().unwrap();
        assert_eq!(closed.status, StrategyStatus::Closed);
        assert_eq!(closed.activated_at, Some(now()));
        assert_eq!(closed.closed_at, Some(now()));
        assert_eq!(closed.close_reason.as_deref(), Some("replaced"));
        assert!(store.list_by_status(StrategyStatus::Active).unwrap().is_empty());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = adapter();
        assert!(matches!(
            store.set_status(99, StrategyStatus::Active, now()),
            Err(LifecycleError::StrategyNotFound { id: 99 })
        ));
        assert!(store.get(99).unwrap().is_none());
    }

    #[test]
    fn snapshot_round_trip() {
        let store = adapter();
        let s = store.insert(&new_strategy(), None, now()).unwrap();
        let snapshot = serde_json::json!({"state": "ARMED", "bar_count": 12});
        store.save_snapshot(s.id, &snapshot).unwrap();
        assert_eq!(store.get(s.id).unwrap().unwrap().runtime_snapshot, Some(snapshot));
    }
}
