//! Strategy evaluator port.

use crate::domain::error::LifecycleError;
use crate::domain::evaluation::{Evaluation, EvaluationRequest};

/// Advisory source of keep/swap/close recommendations. Output is untrusted.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation, LifecycleError>;
}
