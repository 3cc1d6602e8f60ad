//! Persisted strategy records and their lifecycle status.
//!
//! Records are append-only: every content change produces a new version that
//! shares the lineage id of its predecessor.

use crate::domain::program::StrategyProgram;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Draft,
    Pending,
    Active,
    Closed,
    Archived,
    Failed,
}

impl StrategyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyStatus::Draft => "draft",
            StrategyStatus::Pending => "pending",
            StrategyStatus::Active => "active",
            StrategyStatus::Closed => "closed",
            StrategyStatus::Archived => "archived",
            StrategyStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(StrategyStatus::Draft),
            "pending" => Some(StrategyStatus::Pending),
            "active" => Some(StrategyStatus::Active),
            "closed" => Some(StrategyStatus::Closed),
            "archived" => Some(StrategyStatus::Archived),
            "failed" => Some(StrategyStatus::Failed),
            _ => None,
        }
    }

    /// Closed and archived records never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, StrategyStatus::Closed | StrategyStatus::Archived)
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields supplied when creating a strategy or a new version of one.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStrategy {
    pub name: String,
    pub owner: String,
    pub symbol: String,
    pub timeframe: String,
    pub program: StrategyProgram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub id: i64,
    pub lineage_id: i64,
    pub version: i64,
    pub name: String,
    pub owner: String,
    pub symbol: String,
    pub timeframe: String,
    pub status: StrategyStatus,
    pub program: StrategyProgram,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub runtime_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    /// Fields for the next version of this strategy carrying a replacement program.
    pub fn next_version(&self, program: StrategyProgram) -> NewStrategy {
        NewStrategy {
            name: self.name.clone(),
            owner: self.owner.clone(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            program,
        }
    }
}
