//! Domain error types.

use crate::domain::order::{CancelFailure, describe_failures};

/// A parse error with position information for guard expressions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// A guard or feature expression failed to evaluate against the current frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("unknown feature '{name}'")]
    UnknownFeature { name: String },

    #[error("lookback {name}[{offset}] exceeds available history of {available} bars")]
    LookbackOutOfRange {
        name: String,
        offset: usize,
        available: usize,
    },

    #[error("type mismatch in '{op}': expected {expected}")]
    TypeMismatch { op: String, expected: &'static str },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

/// Top-level error type for stratlife.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("bar data error: {reason}")]
    DataSource { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    ExprParse(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("invalid strategy program: {reason}")]
    ProgramInvalid { reason: String },

    #[error("lock '{key}' is already held by this process")]
    LockAlreadyHeld { key: String },

    #[error("lock '{key}' maps to id {lock_id} which is already held for '{other}'")]
    LockKeyCollision {
        key: String,
        other: String,
        lock_id: i64,
    },

    #[error("lock '{key}' could not be acquired within {timeout_ms}ms")]
    LockContention { key: String, timeout_ms: u64 },

    #[error(
        "cancellation incomplete for {symbol}: {} order(s) failed ({})",
        failures.len(),
        describe_failures(failures)
    )]
    PartialCancellation {
        symbol: String,
        failures: Vec<CancelFailure>,
    },

    #[error("position in {symbol} not flat after {timeout_ms}ms (remaining {remaining})")]
    FlattenTimeout {
        symbol: String,
        remaining: f64,
        timeout_ms: u64,
    },

    #[error("broker error: {reason}")]
    Broker { reason: String },

    #[error("operation {id} not found")]
    OperationNotFound { id: i64 },

    #[error("strategy {id} not found")]
    StrategyNotFound { id: i64 },

    #[error("strategy {id} is {status}, expected active")]
    StrategyNotActive { id: i64, status: String },

    #[error("no running instance for strategy {id}")]
    InstanceNotFound { id: i64 },

    #[error("invalid recommendation: {reason}")]
    InvalidRecommendation { reason: String },

    #[error("runtime swap to strategy {new_id} failed: {reason}")]
    SwapFailed { new_id: i64, reason: String },

    #[error("payload serialization error: {reason}")]
    Serialization { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LifecycleError {
    fn from(e: serde_json::Error) -> Self {
        LifecycleError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<&LifecycleError> for std::process::ExitCode {
    fn from(err: &LifecycleError) -> Self {
        let code: u8 = match err {
            LifecycleError::Io(_) => 1,
            LifecycleError::ConfigParse { .. }
            | LifecycleError::ConfigMissing { .. }
            | LifecycleError::ConfigInvalid { .. } => 2,
            LifecycleError::Database { .. }
            | LifecycleError::DatabaseQuery { .. }
            | LifecycleError::DataSource { .. }
            | LifecycleError::Serialization { .. } => 3,
            LifecycleError::ExprParse(_)
            | LifecycleError::Eval(_)
            | LifecycleError::ProgramInvalid { .. } => 4,
            LifecycleError::LockAlreadyHeld { .. }
            | LifecycleError::LockKeyCollision { .. }
            | LifecycleError::LockContention { .. } => 5,
            LifecycleError::PartialCancellation { .. }
            | LifecycleError::FlattenTimeout { .. }
            | LifecycleError::Broker { .. } => 6,
            LifecycleError::OperationNotFound { .. }
            | LifecycleError::StrategyNotFound { .. }
            | LifecycleError::StrategyNotActive { .. }
            | LifecycleError::InstanceNotFound { .. }
            | LifecycleError::InvalidRecommendation { .. }
            | LifecycleError::SwapFailed { .. } => 7,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_context_points_at_column() {
        let err = ParseError {
            message: "expected number".into(),
            position: 8,
        };
        let ctx = err.display_with_context("close > ");
        let lines: Vec<&str> = ctx.lines().collect();
        assert_eq!(lines[0], "close > ");
        assert_eq!(lines[1], "        ^");
        assert!(lines[2].contains("position 8"));
    }

    #[test]
    fn partial_cancellation_reports_each_failure() {
        let err = LifecycleError::PartialCancellation {
            symbol: "SPY".into(),
            failures: vec![
                CancelFailure {
                    order_id: "a".into(),
                    reason: "too late".into(),
                },
                CancelFailure {
                    order_id: "b".into(),
                    reason: "unknown".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "cancellation incomplete for SPY: 2 order(s) failed (a: too late; b: unknown)"
        );
    }

    #[test]
    fn eval_error_converts() {
        let err: LifecycleError = EvalError::UnknownFeature { name: "rsi".into() }.into();
        assert!(matches!(err, LifecycleError::Eval(_)));
    }
}
