//! Evaluator requests and recommendations.

use crate::domain::error::LifecycleError;
use crate::domain::program::{StrategyProgram, check_history_limit, compile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Keep,
    Swap,
    Close,
}

/// What the evaluator sees about a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub strategy_id: i64,
    pub name: String,
    pub symbol: String,
    pub timeframe: String,
    pub state: String,
    pub bar_count: u64,
    pub features: BTreeMap<String, f64>,
    pub net_quantity: f64,
    pub program: StrategyProgram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub recommendation: Recommendation,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub suggested_strategy: Option<StrategyProgram>,
}

impl Evaluation {
    pub fn keep(reason: impl Into<String>) -> Self {
        Evaluation {
            recommendation: Recommendation::Keep,
            confidence: 1.0,
            reason: reason.into(),
            suggested_strategy: None,
        }
    }

    /// Reject advice that cannot be acted on. A swap must carry a program
    /// that compiles within the `max_history` bar cap; confidence must lie
    /// in [0, 1].
    pub fn validate(&self, max_history: usize) -> Result<(), LifecycleError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(LifecycleError::InvalidRecommendation {
                reason: format!("confidence {} outside [0, 1]", self.confidence),
            });
        }
        if self.recommendation == Recommendation::Swap {
            let program = self.suggested_strategy.as_ref().ok_or_else(|| {
                LifecycleError::InvalidRecommendation {
                    reason: "swap recommendation without a suggested strategy".to_string(),
                }
            })?;
            check_history_limit(program, max_history)
                .and_then(|_| compile(program))
                .map_err(|e| LifecycleError::InvalidRecommendation {
                    reason: format!("suggested strategy rejected: {e}"),
                })?;
        }
        Ok(())
    }
}
