//! Configuration validation.
//!
//! Every setting is checked before a component is built from it. Absent keys
//! take their defaults; present but malformed or out-of-range values are
//! errors naming the section and key.

use crate::domain::error::LifecycleError;
use crate::domain::lifecycle::LifecycleSettings;
use crate::domain::order::TradingEnv;
use crate::domain::orchestrator::OrchestratorSettings;
use crate::domain::queue::{DEFAULT_LEASE_SECS, DEFAULT_MAX_RETRIES, QueueSettings};
use crate::domain::risk::RiskLimits;
use crate::ports::config_port::ConfigPort;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use crate::domain::program::DEFAULT_MAX_HISTORY_LIMIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> LifecycleError {
    LifecycleError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parsed<T: FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<T>, LifecycleError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(section, key, format!("cannot parse '{raw}'"))),
    }
}

fn positive_f64(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<f64>, LifecycleError> {
    match parsed::<f64>(config, section, key)? {
        Some(v) if !v.is_finite() || v <= 0.0 => {
            Err(invalid(section, key, format!("{key} must be positive")))
        }
        other => Ok(other),
    }
}

fn positive_u64(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<u64>, LifecycleError> {
    match parsed::<u64>(config, section, key)? {
        Some(0) => Err(invalid(section, key, format!("{key} must be at least 1"))),
        other => Ok(other),
    }
}

fn millis(config: &dyn ConfigPort, section: &str, key: &str, default: Duration) -> Result<Duration, LifecycleError> {
    Ok(positive_u64(config, section, key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

/// Validate every section this process reads.
pub fn validate_config(config: &dyn ConfigPort) -> Result<(), LifecycleError> {
    database_backend(config)?;
    trading_env(config)?;
    build_queue_settings(config)?;
    build_lifecycle_settings(config)?;
    build_risk_limits(config)?;
    build_orchestrator_settings(config)?;
    max_history_limit(config)?;
    validate_log_level(config)?;
    Ok(())
}

pub fn database_backend(config: &dyn ConfigPort) -> Result<DatabaseBackend, LifecycleError> {
    match config.get_string("database", "backend") {
        None => Ok(DatabaseBackend::Sqlite),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseBackend::Sqlite),
            "postgres" | "postgresql" => Ok(DatabaseBackend::Postgres),
            other => Err(invalid(
                "database",
                "backend",
                format!("unknown backend '{other}', expected sqlite or postgres"),
            )),
        },
    }
}

pub fn trading_env(config: &dyn ConfigPort) -> Result<TradingEnv, LifecycleError> {
    match config.get_string("broker", "env") {
        None => Ok(TradingEnv::Paper),
        Some(raw) => TradingEnv::parse(&raw)
            .ok_or_else(|| invalid("broker", "env", "env must be paper or live")),
    }
}

pub fn build_queue_settings(config: &dyn ConfigPort) -> Result<QueueSettings, LifecycleError> {
    let lease_secs = positive_u64(config, "queue", "lease_secs")?
        .map(|v| v as i64)
        .unwrap_or(DEFAULT_LEASE_SECS);
    let max_retries = match parsed::<u32>(config, "queue", "max_retries")? {
        Some(0) => return Err(invalid("queue", "max_retries", "max_retries must be at least 1")),
        Some(v) => v,
        None => DEFAULT_MAX_RETRIES,
    };
    Ok(QueueSettings {
        lease: chrono::Duration::seconds(lease_secs),
        max_retries,
    })
}

pub fn build_lifecycle_settings(config: &dyn ConfigPort) -> Result<LifecycleSettings, LifecycleError> {
    let defaults = LifecycleSettings::default();
    let lock_timeout = match parsed::<u64>(config, "lifecycle", "lock_timeout_ms")? {
        Some(ms) => Duration::from_millis(ms),
        None => defaults.lock_timeout,
    };
    let flatten_timeout = millis(config, "lifecycle", "flatten_timeout_ms", defaults.flatten_timeout)?;
    let flatten_poll = millis(config, "lifecycle", "flatten_poll_ms", defaults.flatten_poll)?;
    if flatten_poll > flatten_timeout {
        return Err(invalid(
            "lifecycle",
            "flatten_poll_ms",
            "flatten_poll_ms must not exceed flatten_timeout_ms",
        ));
    }
    let min_confidence = match parsed::<f64>(config, "lifecycle", "min_confidence")? {
        Some(v) if !(0.0..=1.0).contains(&v) => {
            return Err(invalid(
                "lifecycle",
                "min_confidence",
                "min_confidence must be between 0 and 1",
            ));
        }
        Some(v) => v,
        None => defaults.min_confidence,
    };
    Ok(LifecycleSettings {
        lock_timeout,
        flatten_timeout,
        flatten_poll,
        min_confidence,
        max_history_limit: max_history_limit(config)?,
    })
}

/// Risk limits and the initial kill switch position.
pub fn build_risk_limits(config: &dyn ConfigPort) -> Result<(RiskLimits, bool), LifecycleError> {
    let kill_switch = match config.get_string("risk", "kill_switch") {
        None => false,
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => true,
            "false" | "no" | "0" | "off" => false,
            _ => return Err(invalid("risk", "kill_switch", "kill_switch must be a boolean")),
        },
    };
    let limits = RiskLimits {
        max_daily_loss: positive_f64(config, "risk", "max_daily_loss")?,
        max_open_orders_per_symbol: positive_u64(config, "risk", "max_open_orders_per_symbol")?
            .map(|v| v as usize),
        max_quantity: positive_f64(config, "risk", "max_quantity")?,
        max_notional: positive_f64(config, "risk", "max_notional")?,
    };
    Ok((limits, kill_switch))
}

pub fn build_orchestrator_settings(config: &dyn ConfigPort) -> Result<OrchestratorSettings, LifecycleError> {
    let defaults = OrchestratorSettings::default();
    let evaluation_interval = parsed::<u64>(config, "lifecycle", "evaluation_interval_bars")?
        .unwrap_or(defaults.evaluation_interval);
    let poll_interval = millis(config, "orchestrator", "poll_interval_ms", defaults.poll_interval)?;
    let max_operations_per_cycle =
        positive_u64(config, "orchestrator", "max_operations_per_cycle")?
            .map(|v| v as usize)
            .unwrap_or(defaults.max_operations_per_cycle);
    Ok(OrchestratorSettings {
        evaluation_interval,
        poll_interval,
        max_operations_per_cycle,
    })
}

/// Largest `history_limit` a strategy program may declare.
pub fn max_history_limit(config: &dyn ConfigPort) -> Result<usize, LifecycleError> {
    Ok(positive_u64(config, "engine", "history_limit")?
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_MAX_HISTORY_LIMIT))
}

pub fn data_dir(config: &dyn ConfigPort) -> PathBuf {
    config
        .get_string("orchestrator", "data_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn evaluations_dir(config: &dyn ConfigPort) -> PathBuf {
    config
        .get_string("orchestrator", "evaluations_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("evaluations"))
}

pub fn log_level(config: &dyn ConfigPort) -> Option<String> {
    config
        .get_string("logging", "level")
        .map(|l| l.trim().to_lowercase())
}

fn validate_log_level(config: &dyn ConfigPort) -> Result<(), LifecycleError> {
    match log_level(config).as_deref() {
        None | Some("off" | "error" | "warn" | "info" | "debug" | "trace") => Ok(()),
        Some(other) => Err(invalid(
            "logging",
            "level",
            format!("unknown level '{other}'"),
        )),
    }
}
