//! PostgreSQL persistence and advisory locks.
//!
//! [`PostgresAdapter`] implements the strategy, operation, audit and bar
//! stores over an r2d2 pool. [`PgAdvisoryLock`] owns one dedicated
//! connection: advisory locks are session-scoped, so every lock call for a
//! process must go through the same session.

use crate::domain::audit::AuditEvent;
use crate::domain::bar::Bar;
use crate::domain::error::LifecycleError;
use crate::domain::operation::{EnqueueRequest, Operation, OperationStatus, PayloadEnvelope};
use crate::domain::strategy::{NewStrategy, Strategy, StrategyStatus};
use crate::ports::audit_port::AuditSink;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::BarSource;
use crate::ports::lock_port::AdvisoryLockPort;
use crate::ports::operation_store_port::OperationStore;
use crate::ports::strategy_store_port::StrategyStore;
use chrono::{DateTime, Utc};
use log::warn;
use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS strategies (
    id BIGSERIAL PRIMARY KEY,
    lineage_id BIGINT,
    version BIGINT NOT NULL,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    status TEXT NOT NULL,
    program TEXT NOT NULL,
    activated_at TIMESTAMPTZ,
    closed_at TIMESTAMPTZ,
    close_reason TEXT,
    runtime_snapshot TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (lineage_id, version)
);
CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies(status);

CREATE TABLE IF NOT EXISTS operations (
    id BIGSERIAL PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    op_type TEXT NOT NULL,
    symbol TEXT,
    strategy_id BIGINT,
    priority INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    result TEXT,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    lease_expires_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_operations_claim ON operations(status, priority, created_at);

CREATE TABLE IF NOT EXISTS audit_log (
    id BIGSERIAL PRIMARY KEY,
    strategy_id BIGINT,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT NOT NULL,
    at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_strategy ON audit_log(strategy_id, at);

CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts TIMESTAMPTZ NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts)
);
";

const STRATEGY_COLUMNS: &str = "id, lineage_id, version, name, owner, symbol, timeframe, status, \
                                program, activated_at, closed_at, close_reason, runtime_snapshot, \
                                created_at";

const OPERATION_COLUMNS: &str = "id, idempotency_key, op_type, symbol, strategy_id, priority, \
                                 payload, status, retry_count, max_retries, result, error, \
                                 created_at, updated_at, lease_expires_at";

type Manager = PostgresConnectionManager<NoTls>;

fn query_err(e: postgres::Error) -> LifecycleError {
    LifecycleError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn connection_string(config: &dyn ConfigPort) -> Result<String, LifecycleError> {
    config
        .get_string("postgres", "connection_string")
        .ok_or_else(|| LifecycleError::ConfigMissing {
            section: "postgres".into(),
            key: "connection_string".into(),
        })
}

fn json_text<T: serde::de::DeserializeOwned>(column: &str, text: &str) -> Result<T, LifecycleError> {
    serde_json::from_str(text).map_err(|e| LifecycleError::DatabaseQuery {
        reason: format!("column {column}: {e}"),
    })
}

fn map_strategy(row: &Row) -> Result<Strategy, LifecycleError> {
    let status_text: String = row.try_get(7).map_err(query_err)?;
    let status = StrategyStatus::parse(&status_text).ok_or_else(|| LifecycleError::DatabaseQuery {
        reason: format!("unknown strategy status '{status_text}'"),
    })?;
    let program_text: String = row.try_get(8).map_err(query_err)?;
    let snapshot_text: Option<String> = row.try_get(12).map_err(query_err)?;
    Ok(Strategy {
        id: row.try_get(0).map_err(query_err)?,
        lineage_id: row.try_get(1).map_err(query_err)?,
        version: row.try_get(2).map_err(query_err)?,
        name: row.try_get(3).map_err(query_err)?,
        owner: row.try_get(4).map_err(query_err)?,
        symbol: row.try_get(5).map_err(query_err)?,
        timeframe: row.try_get(6).map_err(query_err)?,
        status,
        program: json_text("program", &program_text)?,
        activated_at: row.try_get(9).map_err(query_err)?,
        closed_at: row.try_get(10).map_err(query_err)?,
        close_reason: row.try_get(11).map_err(query_err)?,
        runtime_snapshot: snapshot_text
            .map(|text| json_text("runtime_snapshot", &text))
            .transpose()?,
        created_at: row.try_get(13).map_err(query_err)?,
    })
}

fn map_operation(row: &Row) -> Result<Operation, LifecycleError> {
    let payload_text: String = row.try_get(6).map_err(query_err)?;
    let envelope: PayloadEnvelope = json_text("payload", &payload_text)?;
    let status_text: String = row.try_get(7).map_err(query_err)?;
    let status = OperationStatus::parse(&status_text).ok_or_else(|| LifecycleError::DatabaseQuery {
        reason: format!("unknown operation status '{status_text}'"),
    })?;
    let retry_count: i32 = row.try_get(8).map_err(query_err)?;
    let max_retries: i32 = row.try_get(9).map_err(query_err)?;
    let result_text: Option<String> = row.try_get(10).map_err(query_err)?;
    Ok(Operation {
        id: row.try_get(0).map_err(query_err)?,
        idempotency_key: row.try_get(1).map_err(query_err)?,
        op_type: row.try_get(2).map_err(query_err)?,
        symbol: row.try_get(3).map_err(query_err)?,
        strategy_id: row.try_get(4).map_err(query_err)?,
        priority: row.try_get(5).map_err(query_err)?,
        payload: envelope.payload,
        metadata: envelope.metadata,
        status,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        result: result_text
            .map(|text| json_text::<Value>("result", &text))
            .transpose()?,
        error: row.try_get(11).map_err(query_err)?,
        created_at: row.try_get(12).map_err(query_err)?,
        updated_at: row.try_get(13).map_err(query_err)?,
        lease_expires_at: row.try_get(14).map_err(query_err)?,
    })
}

pub struct PostgresAdapter {
    pool: Pool<Manager>,
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, LifecycleError> {
        let conninfo = connection_string(config)?;
        let pool_size = config.get_int("postgres", "pool_size", 4).max(1) as u32;
        let manager = PostgresConnectionManager::new(
            conninfo.parse().map_err(|e: postgres::Error| LifecycleError::ConfigInvalid {
                section: "postgres".into(),
                key: "connection_string".into(),
                reason: e.to_string(),
            })?,
            NoTls,
        );
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e: r2d2::Error| LifecycleError::Database {
                reason: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), LifecycleError> {
        self.conn()?.batch_execute(SCHEMA).map_err(query_err)
    }

    fn conn(&self) -> Result<PooledConnection<Manager>, LifecycleError> {
        self.pool.get().map_err(|e: r2d2::Error| LifecycleError::Database {
            reason: e.to_string(),
        })
    }

    fn fetch_strategy(&self, id: i64) -> Result<Option<Strategy>, LifecycleError> {
        let row = self
            .conn()?
            .query_opt(
                &format!("SELECT {STRATEGY_COLUMNS} FROM strategies WHERE id = $1"),
                &[&id],
            )
            .map_err(query_err)?;
        row.as_ref().map(map_strategy).transpose()
    }

    fn query_strategies(
        &self,
        filter: &str,
        param: &(dyn ToSql + Sync),
    ) -> Result<Vec<Strategy>, LifecycleError> {
        let rows = self
            .conn()?
            .query(
                &format!("SELECT {STRATEGY_COLUMNS} FROM strategies WHERE {filter} ORDER BY id ASC"),
                &[param],
            )
            .map_err(query_err)?;
        rows.iter().map(map_strategy).collect()
    }

    pub fn insert_bars(&self, timeframe: &str, bars: &[Bar]) -> Result<usize, LifecycleError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(query_err)?;
        let stmt = tx
            .prepare(
                "INSERT INTO bars (symbol, timeframe, ts, open, high, low, close, volume)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (symbol, timeframe, ts) DO UPDATE
                 SET open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low,
                     close = EXCLUDED.close, volume = EXCLUDED.volume",
            )
            .map_err(query_err)?;
        for bar in bars {
            tx.execute(
                &stmt,
                &[
                    &bar.symbol,
                    &timeframe,
                    &bar.timestamp,
                    &bar.open,
                    &bar.high,
                    &bar.low,
                    &bar.close,
                    &bar.volume,
                ],
            )
            .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)?;
        Ok(bars.len())
    }
}

impl StrategyStore for PostgresAdapter {
    fn insert(
        &self,
        strategy: &NewStrategy,
        lineage: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Strategy, LifecycleError> {
        let program = serde_json::to_string(&strategy.program)?;
        let id: i64 = {
            let mut conn = self.conn()?;
            let mut tx = conn.transaction().map_err(query_err)?;
            let version: i64 = match lineage {
                Some(lineage_id) => tx
                    .query_one(
                        "SELECT COALESCE(MAX(version), 0) + 1 FROM strategies WHERE lineage_id = $1",
                        &[&lineage_id],
                    )
                    .map_err(query_err)?
                    .try_get(0)
                    .map_err(query_err)?,
                None => 1,
            };
            let row = tx
                .query_one(
                    "INSERT INTO strategies (lineage_id, version, name, owner, symbol, timeframe,
                                             status, program, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     RETURNING id",
                    &[
                        &lineage,
                        &version,
                        &strategy.name,
                        &strategy.owner,
                        &strategy.symbol,
                        &strategy.timeframe,
                        &StrategyStatus::Draft.as_str(),
                        &program,
                        &now,
                    ],
                )
                .map_err(query_err)?;
            let id: i64 = row.try_get(0).map_err(query_err)?;
            if lineage.is_none() {
                tx.execute("UPDATE strategies SET lineage_id = id WHERE id = $1", &[&id])
                    .map_err(query_err)?;
            }
            tx.commit().map_err(query_err)?;
            id
        };
        self.fetch_strategy(id)?
            .ok_or(LifecycleError::StrategyNotFound { id })
    }

    fn get(&self, id: i64) -> Result<Option<Strategy>, LifecycleError> {
        self.fetch_strategy(id)
    }

    fn list_by_status(&self, status: StrategyStatus) -> Result<Vec<Strategy>, LifecycleError> {
        self.query_strategies("status = $1", &status.as_str())
    }

    fn versions(&self, lineage_id: i64) -> Result<Vec<Strategy>, LifecycleError> {
        self.query_strategies("lineage_id = $1", &lineage_id)
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
                 SET status = $2,
                     activated_at = CASE WHEN $2 = 'active' THEN $3 ELSE activated_at END
                 WHERE id = $1",
                &[&id, &status.as_str(), &now],
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
                "UPDATE strategies SET status = 'closed', closed_at = $2, close_reason = $3
                 WHERE id = $1",
                &[&id, &now, &reason],
            )
            .map_err(query_err)?;
        if updated == 0 {
            return Err(LifecycleError::StrategyNotFound { id });
        }
        Ok(())
    }

    fn save_snapshot(&self, id: i64, snapshot: &Value) -> Result<(), LifecycleError> {
        let text = serde_json::to_string(snapshot)?;
        self.conn()?
            .execute(
                "UPDATE strategies SET runtime_snapshot = $2 WHERE id = $1",
                &[&id, &text],
            )
            .map_err(query_err)?;
        Ok(())
    }
}

impl OperationStore for PostgresAdapter {
    fn insert_if_absent(
        &self,
        request: &EnqueueRequest,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, LifecycleError> {
        let payload = serde_json::to_string(&request.envelope())?;
        let max_retries = max_retries as i32;
        let row = self
            .conn()?
            .query_opt(
                "INSERT INTO operations (idempotency_key, op_type, symbol, strategy_id, priority,
                                         payload, status, retry_count, max_retries,
                                         created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $8)
                 ON CONFLICT (idempotency_key) DO NOTHING
                 RETURNING id",
                &[
                    &request.idempotency_key,
                    &request.payload.kind(),
                    &request.symbol,
                    &request.payload.strategy_id(),
                    &request.priority,
                    &payload,
                    &max_retries,
                    &now,
                ],
            )
            .map_err(query_err)?;
        row.map(|r| r.try_get(0).map_err(query_err)).transpose()
    }

    fn find_by_key(&self, key: &str) -> Result<Option<Operation>, LifecycleError> {
        let row = self
            .conn()?
            .query_opt(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE idempotency_key = $1"),
                &[&key],
            )
            .map_err(query_err)?;
        row.as_ref().map(map_operation).transpose()
    }

    fn get(&self, id: i64) -> Result<Option<Operation>, LifecycleError> {
        let row = self
            .conn()?
            .query_opt(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1"),
                &[&id],
            )
            .map_err(query_err)?;
        row.as_ref().map(map_operation).transpose()
    }

    fn next_candidate(&self, now: DateTime<Utc>) -> Result<Option<i64>, LifecycleError> {
        let row = self
            .conn()?
            .query_opt(
                "SELECT id FROM operations
                 WHERE status = 'pending'
                    OR (status = 'in_progress' AND lease_expires_at <= $1)
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1",
                &[&now],
            )
            .map_err(query_err)?;
        row.map(|r| r.try_get(0).map_err(query_err)).transpose()
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
                 SET status = 'in_progress', lease_expires_at = $3, updated_at = $2
                 WHERE id = $1
                   AND (status = 'pending'
                        OR (status = 'in_progress' AND lease_expires_at <= $2))",
                &[&id, &now, &lease_until],
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
                 SET status = 'completed', result = $2, error = NULL,
                     lease_expires_at = NULL, updated_at = $3
                 WHERE id = $1 AND status IN ('pending', 'in_progress')",
                &[&id, &result_text, &now],
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
        let row = self
            .conn()?
            .query_opt(
                "UPDATE operations
                 SET retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 < max_retries
                                   THEN 'pending' ELSE 'failed' END,
                     error = $2, lease_expires_at = NULL, updated_at = $3
                 WHERE id = $1 AND status IN ('pending', 'in_progress')
                 RETURNING status",
                &[&id, &error, &now],
            )
            .map_err(query_err)?;
        let status: Option<String> = row
            .map(|r| r.try_get(0).map_err(query_err))
            .transpose()?;
        Ok(status.as_deref().and_then(OperationStatus::parse))
    }

    fn cancel(&self, id: i64, now: DateTime<Utc>) -> Result<bool, LifecycleError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE operations SET status = 'cancelled', updated_at = $2
                 WHERE id = $1 AND status = 'pending'",
                &[&id, &now],
            )
            .map_err(query_err)?;
        Ok(updated == 1)
    }

    fn release_expired(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE operations SET status = 'pending', lease_expires_at = NULL, updated_at = $1
                 WHERE status = 'in_progress' AND lease_expires_at <= $1",
                &[&now],
            )
            .map_err(query_err)?;
        Ok(updated as usize)
    }

    fn list(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>, LifecycleError> {
        let status = status.map(|s| s.as_str());
        let rows = self
            .conn()?
            .query(
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM operations
                     WHERE $1::TEXT IS NULL OR status = $1
                     ORDER BY id ASC"
                ),
                &[&status],
            )
            .map_err(query_err)?;
        rows.iter().map(map_operation).collect()
    }
}

impl AuditSink for PostgresAdapter {
    fn record(&self, event: &AuditEvent) -> Result<(), LifecycleError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        self.conn()?
            .execute(
                "INSERT INTO audit_log (strategy_id, kind, message, metadata, at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &event.strategy_id,
                    &event.kind.as_str(),
                    &event.message,
                    &metadata,
                    &event.at,
                ],
            )
            .map_err(query_err)?;
        Ok(())
    }
}

impl BarSource for PostgresAdapter {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError> {
        let rows = self
            .conn()?
            .query(
                "SELECT ts, open, high, low, close, volume FROM bars
                 WHERE symbol = $1 AND timeframe = $2
                   AND ($3::TIMESTAMPTZ IS NULL OR ts > $3)
                 ORDER BY ts ASC",
                &[&symbol, &timeframe, &since],
            )
            .map_err(query_err)?;
        rows.iter()
            .map(|row| {
                Ok(Bar {
                    symbol: symbol.to_string(),
                    timestamp: row.try_get(0).map_err(query_err)?,
                    open: row.try_get(1).map_err(query_err)?,
                    high: row.try_get(2).map_err(query_err)?,
                    low: row.try_get(3).map_err(query_err)?,
                    close: row.try_get(4).map_err(query_err)?,
                    volume: row.try_get(5).map_err(query_err)?,
                })
            })
            .collect()
    }
}

/// Advisory locks on one dedicated session.
pub struct PgAdvisoryLock {
    client: Mutex<Client>,
}

impl PgAdvisoryLock {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, LifecycleError> {
        let conninfo = connection_string(config)?;
        let client = Client::connect(&conninfo, NoTls).map_err(|e| LifecycleError::Database {
            reason: e.to_string(),
        })?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn client(&self) -> MutexGuard<'_, Client> {
        self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const LOCK_NOT_AVAILABLE: &str = "55P03";

/// `0` disables `lock_timeout` in PostgreSQL, so round up to one millisecond.
fn lock_timeout_statement(timeout: Duration) -> String {
    format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1))
}

impl AdvisoryLockPort for PgAdvisoryLock {
    fn try_lock(&self, lock_id: i64) -> Result<bool, LifecycleError> {
        self.client()
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id])
            .and_then(|row| row.try_get(0))
            .map_err(query_err)
    }

    fn lock_timeout(&self, lock_id: i64, timeout: Duration) -> Result<bool, LifecycleError> {
        let mut client = self.client();
        let mut tx = client.transaction().map_err(query_err)?;
        tx.batch_execute(&lock_timeout_statement(timeout))
            .map_err(query_err)?;
        match tx.execute("SELECT pg_advisory_lock($1)", &[&lock_id]) {
            Ok(_) => {
                tx.commit().map_err(query_err)?;
                Ok(true)
            }
            Err(e) if e.code().is_some_and(|c| c.code() == LOCK_NOT_AVAILABLE) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("rollback after lock timeout failed: {rollback}");
                }
                Ok(false)
            }
            Err(e) => Err(query_err(e)),
        }
    }

    fn unlock(&self, lock_id: i64) -> Result<bool, LifecycleError> {
        self.client()
            .query_one("SELECT pg_advisory_unlock($1)", &[&lock_id])
            .and_then(|row| row.try_get(0))
            .map_err(query_err)
    }
}
