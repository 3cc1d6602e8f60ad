//! SQLite persistence: strategies, the operation queue, the audit log and bars.
//!
//! Timestamps are stored as epoch milliseconds. Status changes are single
//! conditional `UPDATE` statements.

mod audit;
mod bars;
mod operations;
mod strategies;

pub use audit::AuditRow;

use crate::domain::error::LifecycleError;
use crate::ports::config_port::ConfigPort;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS strategies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lineage_id INTEGER,
    version INTEGER NOT NULL,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    status TEXT NOT NULL,
    program TEXT NOT NULL,
    activated_at INTEGER,
    closed_at INTEGER,
    close_reason TEXT,
    runtime_snapshot TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies(status);
CREATE INDEX IF NOT EXISTS idx_strategies_lineage ON strategies(lineage_id, version);

CREATE TABLE IF NOT EXISTS operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL UNIQUE,
    op_type TEXT NOT NULL,
    symbol TEXT,
    strategy_id INTEGER,
    priority INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    result TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    lease_expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_operations_claim ON operations(status, priority, created_at);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id INTEGER,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT NOT NULL,
    at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_strategy ON audit_log(strategy_id, at);

CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts)
);
";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, LifecycleError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| LifecycleError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;
        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;
        Self::open(&db_path, pool_size)
    }

    pub fn open(path: &str, pool_size: u32) -> Result<Self, LifecycleError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e: r2d2::Error| LifecycleError::Database {
                reason: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, LifecycleError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e: r2d2::Error| LifecycleError::Database {
                reason: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), LifecycleError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, LifecycleError> {
        self.pool.get().map_err(|e: r2d2::Error| LifecycleError::Database {
            reason: e.to_string(),
        })
    }
}

fn query_err(e: rusqlite::Error) -> LifecycleError {
    LifecycleError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_err(
    column: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug)]
struct BadTimestamp(i64);

impl std::fmt::Display for BadTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timestamp {} ms out of range", self.0)
    }
}

impl std::error::Error for BadTimestamp {}

fn from_ms(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| conversion_err(column, BadTimestamp(ms)))
}

fn from_ms_opt(column: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|v| from_ms(column, v)).transpose()
}

fn json_column<T: serde::de::DeserializeOwned>(column: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| conversion_err(column, e))
}
