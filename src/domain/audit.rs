//! Audit records appended for every externally visible lifecycle decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Transition,
    OrderSubmitted,
    OrdersCancelled,
    ReplaySuppressed,
    GuardRejected,
    ActionFailed,
    Evaluation,
    SwapCompleted,
    SwapFailed,
    StrategyClosed,
    CloseFailed,
    LockContention,
    PositionFlattened,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Transition => "transition",
            AuditKind::OrderSubmitted => "order_submitted",
            AuditKind::OrdersCancelled => "orders_cancelled",
            AuditKind::ReplaySuppressed => "replay_suppressed",
            AuditKind::GuardRejected => "guard_rejected",
            AuditKind::ActionFailed => "action_failed",
            AuditKind::Evaluation => "evaluation",
            AuditKind::SwapCompleted => "swap_completed",
            AuditKind::SwapFailed => "swap_failed",
            AuditKind::StrategyClosed => "strategy_closed",
            AuditKind::CloseFailed => "close_failed",
            AuditKind::LockContention => "lock_contention",
            AuditKind::PositionFlattened => "position_flattened",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub strategy_id: Option<i64>,
    pub kind: AuditKind,
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        strategy_id: Option<i64>,
        kind: AuditKind,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        AuditEvent {
            strategy_id,
            kind,
            message: message.into(),
            metadata: Map::new(),
            at,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
