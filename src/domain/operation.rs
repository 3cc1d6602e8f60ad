//! Queued units of retryable work.

use crate::domain::program::StrategyProgram;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OperationStatus::Pending),
            "in_progress" => Some(OperationStatus::InProgress),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            "cancelled" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known operation shapes. Anything else travels as `Custom` with its data in
/// the operation's metadata map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    Swap {
        strategy_id: i64,
        program: StrategyProgram,
        reason: String,
        confidence: f64,
    },
    Close {
        strategy_id: i64,
        reason: String,
    },
    Custom {
        kind: String,
    },
}

impl OperationPayload {
    /// Type tag stored alongside the operation.
    pub fn kind(&self) -> &str {
        match self {
            OperationPayload::Swap { .. } => "swap",
            OperationPayload::Close { .. } => "close",
            OperationPayload::Custom { kind } => kind,
        }
    }

    pub fn strategy_id(&self) -> Option<i64> {
        match self {
            OperationPayload::Swap { strategy_id, .. }
            | OperationPayload::Close { strategy_id, .. } => Some(*strategy_id),
            OperationPayload::Custom { .. } => None,
        }
    }
}

/// Payload plus the open metadata map, as persisted in the payload column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    #[serde(flatten)]
    pub payload: OperationPayload,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub idempotency_key: String,
    pub symbol: Option<String>,
    pub priority: i32,
    pub payload: OperationPayload,
    pub metadata: Map<String, Value>,
    /// Overrides the queue default when set.
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(idempotency_key: impl Into<String>, payload: OperationPayload) -> Self {
        EnqueueRequest {
            idempotency_key: idempotency_key.into(),
            symbol: None,
            priority: 0,
            payload,
            metadata: Map::new(),
            max_retries: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn envelope(&self) -> PayloadEnvelope {
        PayloadEnvelope {
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: i64,
    pub idempotency_key: String,
    pub op_type: String,
    pub symbol: Option<String>,
    pub strategy_id: Option<i64>,
    pub priority: i32,
    pub payload: OperationPayload,
    pub metadata: Map<String, Value>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}
