//! Swap and close protocol for running strategy instances.
//!
//! # Protocol
//!
//! 1. Enqueue the intent under an idempotency key built from the operation
//!    type, strategy id, symbol and (for swaps) a hash of the replacement
//!    program
//! 2. Return the stored result if the operation already completed
//! 3. Claim the operation, then take the strategy lock with a short timeout;
//!    contention fails the operation and returns without raising
//! 4. Cancel the instance's open orders; any per-order failure aborts with the
//!    old instance untouched
//! 5. Flatten the broker-reported position and poll until flat or timed out
//! 6. Swap: create the new version as draft, swap it in at runtime, then
//!    activate it and close the old record, in that order. Close: mark the
//!    record closed and remove the instance
//! 7. Complete the operation with a replayable result. The lock is released on
//!    every path
//!
//! Operations left `pending` by an earlier failed attempt are picked up by a
//! queue worker through [`LifecycleManager::process_claimed`].

use crate::domain::audit::{AuditEvent, AuditKind};
use crate::domain::engine::{EngineSnapshot, StrategyEngine};
use crate::domain::error::LifecycleError;
use crate::domain::evaluation::{EvaluationRequest, Recommendation};
use crate::domain::lock::{LockService, stable_hash, strategy_lock_key};
use crate::domain::operation::{EnqueueRequest, Operation, OperationPayload, OperationStatus};
use crate::domain::order::{Order, OrderPlan, Side, TradingEnv, failures_value};
use crate::domain::program::{DEFAULT_MAX_HISTORY_LIMIT, StrategyProgram, check_history_limit};
use crate::domain::queue::OperationQueue;
use crate::domain::strategy::{Strategy, StrategyStatus};
use crate::ports::audit_port::AuditSink;
use crate::ports::broker_port::BrokerPort;
use crate::ports::clock_port::Clock;
use crate::ports::evaluator_port::Evaluator;
use crate::ports::portfolio_port::PositionSource;
use crate::ports::strategy_store_port::StrategyStore;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FLAT_EPSILON: f64 = 1e-9;
pub const SWAP_PRIORITY: i32 = 10;
pub const CLOSE_PRIORITY: i32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleSettings {
    pub lock_timeout: Duration,
    pub flatten_timeout: Duration,
    pub flatten_poll: Duration,
    pub min_confidence: f64,
    /// Cap on `history_limit` for replacement programs.
    pub max_history_limit: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        LifecycleSettings {
            lock_timeout: Duration::from_secs(5),
            flatten_timeout: Duration::from_secs(30),
            flatten_poll: Duration::from_millis(500),
            min_confidence: 0.0,
            max_history_limit: DEFAULT_MAX_HISTORY_LIMIT,
        }
    }
}

/// The set of running engine instances the manager mutates.
pub trait StrategyRuntime {
    fn instance_mut(&mut self, strategy_id: i64) -> Option<&mut StrategyEngine>;

    /// Replace the instance for `old_id` with a fresh engine for `replacement`.
    /// On error the old instance must still be running.
    fn swap_instance(&mut self, old_id: i64, replacement: Strategy) -> Result<(), LifecycleError>;

    fn remove_instance(&mut self, strategy_id: i64) -> Option<StrategyEngine>;
}

/// Result stored on a completed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LifecycleResult {
    Swapped {
        old_strategy_id: i64,
        new_strategy_id: i64,
    },
    Closed {
        strategy_id: i64,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleOutcome {
    Kept {
        reason: String,
    },
    Applied {
        operation_id: i64,
        result: LifecycleResult,
    },
    /// Completed earlier; nothing was re-run.
    AlreadyCompleted {
        operation_id: i64,
        result: Value,
    },
    LockContended {
        operation_id: i64,
    },
    /// Claimed by another worker, terminally failed, or cancelled.
    NotClaimed {
        operation_id: i64,
        status: Option<OperationStatus>,
    },
}

pub struct LifecycleManager {
    strategies: Arc<dyn StrategyStore>,
    queue: Arc<OperationQueue>,
    locks: Arc<LockService>,
    broker: Arc<dyn BrokerPort>,
    positions: Arc<dyn PositionSource>,
    evaluator: Arc<dyn Evaluator>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    env: TradingEnv,
    settings: LifecycleSettings,
}

pub struct LifecycleDeps {
    pub strategies: Arc<dyn StrategyStore>,
    pub queue: Arc<OperationQueue>,
    pub locks: Arc<LockService>,
    pub broker: Arc<dyn BrokerPort>,
    pub positions: Arc<dyn PositionSource>,
    pub evaluator: Arc<dyn Evaluator>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub env: TradingEnv,
}

pub fn swap_key(strategy_id: i64, symbol: &str, program: &StrategyProgram) -> Result<String, LifecycleError> {
    let content = serde_json::to_string(program)?;
    Ok(format!(
        "swap:{strategy_id}:{symbol}:{:016x}",
        stable_hash(content.as_bytes())
    ))
}

pub fn close_key(strategy_id: i64, symbol: &str) -> String {
    format!("close:{strategy_id}:{symbol}")
}

impl LifecycleManager {
    pub fn new(deps: LifecycleDeps, settings: LifecycleSettings) -> Self {
        LifecycleManager {
            strategies: deps.strategies,
            queue: deps.queue,
            locks: deps.locks,
            broker: deps.broker,
            positions: deps.positions,
            evaluator: deps.evaluator,
            audit: deps.audit,
            clock: deps.clock,
            env: deps.env,
            settings,
        }
    }

    fn event(&self, strategy_id: i64, kind: AuditKind, message: impl Into<String>) -> AuditEvent {
        AuditEvent::new(Some(strategy_id), kind, message, self.clock.now())
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event) {
            warn!(
                "audit write failed for strategy {:?} ({}): {e}",
                event.strategy_id,
                event.kind.as_str()
            );
        }
    }

    /// Ask the evaluator about a running instance and act on its advice.
    pub fn evaluate_strategy(
        &self,
        runtime: &mut dyn StrategyRuntime,
        strategy_id: i64,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let engine = runtime
            .instance_mut(strategy_id)
            .ok_or(LifecycleError::InstanceNotFound { id: strategy_id })?;
        let strategy = engine.strategy().clone();
        let request = EvaluationRequest {
            strategy_id,
            name: strategy.name.clone(),
            symbol: strategy.symbol.clone(),
            timeframe: strategy.timeframe.clone(),
            state: engine.state().to_string(),
            bar_count: engine.bar_count(),
            features: engine.frame().snapshot(),
            net_quantity: self.positions.net_quantity(&strategy.symbol, false)?,
            program: strategy.program.clone(),
        };

        let evaluation = self.evaluator.evaluate(&request)?;
        if let Err(e) = evaluation.validate(self.settings.max_history_limit) {
            warn!("[strategy {strategy_id} {}] rejected evaluation: {e}", strategy.symbol);
            self.record(
                self.event(strategy_id, AuditKind::Evaluation, e.to_string())
                    .with("accepted", false),
            );
            return Err(e);
        }
        self.record(
            self.event(strategy_id, AuditKind::Evaluation, evaluation.reason.clone())
                .with("recommendation", format!("{:?}", evaluation.recommendation).to_lowercase())
                .with("confidence", evaluation.confidence),
        );

        if evaluation.recommendation != Recommendation::Keep
            && evaluation.confidence < self.settings.min_confidence
        {
            info!(
                "[strategy {strategy_id} {}] {:?} at confidence {:.2} below floor {:.2}, keeping",
                strategy.symbol,
                evaluation.recommendation,
                evaluation.confidence,
                self.settings.min_confidence
            );
            return Ok(LifecycleOutcome::Kept {
                reason: format!("confidence {:.2} below floor", evaluation.confidence),
            });
        }

        match (evaluation.recommendation, evaluation.suggested_strategy) {
            (Recommendation::Keep, _) => Ok(LifecycleOutcome::Kept {
                reason: evaluation.reason,
            }),
            (Recommendation::Swap, Some(program)) => self.swap(
                runtime,
                strategy_id,
                program,
                &evaluation.reason,
                evaluation.confidence,
            ),
            (Recommendation::Swap, None) => Err(LifecycleError::InvalidRecommendation {
                reason: "swap recommendation without a suggested strategy".to_string(),
            }),
            (Recommendation::Close, _) => self.close(runtime, strategy_id, &evaluation.reason),
        }
    }

    /// Replace a running strategy with a new version carrying `program`.
    pub fn swap(
        &self,
        runtime: &mut dyn StrategyRuntime,
        strategy_id: i64,
        program: StrategyProgram,
        reason: &str,
        confidence: f64,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        check_history_limit(&program, self.settings.max_history_limit)?;
        let old = self
            .strategies
            .get(strategy_id)?
            .ok_or(LifecycleError::StrategyNotFound { id: strategy_id })?;
        let request = EnqueueRequest::new(
            swap_key(strategy_id, &old.symbol, &program)?,
            OperationPayload::Swap {
                strategy_id,
                program: program.clone(),
                reason: reason.to_string(),
                confidence,
            },
        )
        .with_symbol(old.symbol.clone())
        .with_priority(SWAP_PRIORITY);

        self.run_operation(&request, strategy_id, |manager, operation_id| {
            manager.apply_swap(runtime, &old, program, reason, operation_id)
        })
    }

    /// Stop a running strategy: cancel, flatten, mark closed, remove.
    pub fn close(
        &self,
        runtime: &mut dyn StrategyRuntime,
        strategy_id: i64,
        reason: &str,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let strategy = self
            .strategies
            .get(strategy_id)?
            .ok_or(LifecycleError::StrategyNotFound { id: strategy_id })?;
        let request = EnqueueRequest::new(
            close_key(strategy_id, &strategy.symbol),
            OperationPayload::Close {
                strategy_id,
                reason: reason.to_string(),
            },
        )
        .with_symbol(strategy.symbol.clone())
        .with_priority(CLOSE_PRIORITY);

        self.run_operation(&request, strategy_id, |manager, operation_id| {
            manager.apply_close(runtime, &strategy, reason, operation_id)
        })
    }

    /// Execute an operation a queue worker has already claimed.
    pub fn process_claimed(
        &self,
        runtime: &mut dyn StrategyRuntime,
        operation: &Operation,
    ) -> Result<LifecycleOutcome, LifecycleError> {
        let operation_id = operation.id;
        match &operation.payload {
            OperationPayload::Swap {
                strategy_id,
                program,
                reason,
                ..
            } => {
                let old = self.load_strategy(operation_id, *strategy_id)?;
                self.execute(operation_id, old.id, |manager| {
                    manager.apply_swap(runtime, &old, program.clone(), reason, operation_id)
                })
            }
            OperationPayload::Close {
                strategy_id,
                reason,
            } => {
                let strategy = self.load_strategy(operation_id, *strategy_id)?;
                self.execute(operation_id, strategy.id, |manager| {
                    manager.apply_close(runtime, &strategy, reason, operation_id)
                })
            }
            OperationPayload::Custom { kind } => {
                warn!("operation {operation_id}: no handler for '{kind}'");
                let status = self
                    .queue
                    .fail(operation_id, &format!("unsupported operation type '{kind}'"))?;
                Ok(LifecycleOutcome::NotClaimed {
                    operation_id,
                    status: Some(status),
                })
            }
        }
    }

    fn load_strategy(&self, operation_id: i64, strategy_id: i64) -> Result<Strategy, LifecycleError> {
        let loaded = self
            .strategies
            .get(strategy_id)
            .and_then(|found| found.ok_or(LifecycleError::StrategyNotFound { id: strategy_id }));
        if let Err(e) = &loaded {
            self.queue.fail(operation_id, &e.to_string())?;
        }
        loaded
    }

    fn ensure_active(strategy: &Strategy) -> Result<(), LifecycleError> {
        if strategy.status == StrategyStatus::Active {
            Ok(())
        } else {
            Err(LifecycleError::StrategyNotActive {
                id: strategy.id,
                status: strategy.status.to_string(),
            })
        }
    }

    fn run_operation<F>(
        &self,
        request: &EnqueueRequest,
        strategy_id: i64,
        body: F,
    ) -> Result<LifecycleOutcome, LifecycleError>
    where
        F: FnOnce(&Self, i64) -> Result<LifecycleResult, LifecycleError>,
    {
        let operation_id = self.queue.enqueue(request)?;
        if self.queue.is_completed(operation_id)? {
            let result = self.queue.get_result(operation_id)?.unwrap_or(Value::Null);
            info!(
                "operation {operation_id} ({}) already completed",
                request.idempotency_key
            );
            return Ok(LifecycleOutcome::AlreadyCompleted {
                operation_id,
                result,
            });
        }
        if !self.queue.claim(operation_id)? {
            let status = self.queue.get(operation_id)?.map(|op| op.status);
            info!(
                "operation {operation_id} ({}) not claimable, status {:?}",
                request.idempotency_key, status
            );
            return Ok(LifecycleOutcome::NotClaimed {
                operation_id,
                status,
            });
        }
        self.execute(operation_id, strategy_id, |manager| body(manager, operation_id))
    }

    /// Lock, run `body`, and settle the claimed operation.
    fn execute<F>(
        &self,
        operation_id: i64,
        strategy_id: i64,
        body: F,
    ) -> Result<LifecycleOutcome, LifecycleError>
    where
        F: FnOnce(&Self) -> Result<LifecycleResult, LifecycleError>,
    {
        let key = strategy_lock_key(strategy_id);
        let guard = match self.locks.acquire_guard(&key, self.settings.lock_timeout) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!(
                    "operation {operation_id}: lock '{key}' busy after {}ms",
                    self.settings.lock_timeout.as_millis()
                );
                self.queue.fail(operation_id, "lock contention")?;
                self.record(
                    self.event(strategy_id, AuditKind::LockContention, "lock contention")
                        .with("operation_id", operation_id),
                );
                return Ok(LifecycleOutcome::LockContended { operation_id });
            }
            Err(e) => {
                self.queue.fail(operation_id, &e.to_string())?;
                return Err(e);
            }
        };

        match body(self) {
            Ok(result) => {
                // Already applied: settle failures are logged, not returned.
                match serde_json::to_value(&result) {
                    Ok(value) => {
                        if let Err(e) = self.queue.complete(operation_id, &value) {
                            error!(
                                "operation {operation_id} applied but not marked complete: {e}"
                            );
                        }
                    }
                    Err(e) => error!("operation {operation_id} result not serializable: {e}"),
                }
                if let Err(e) = guard.release() {
                    warn!("operation {operation_id}: releasing lock '{key}' failed: {e}");
                }
                Ok(LifecycleOutcome::Applied {
                    operation_id,
                    result,
                })
            }
            Err(e) => {
                error!("operation {operation_id} for strategy {strategy_id} failed: {e}");
                if let Err(queue_err) = self.queue.fail(operation_id, &e.to_string()) {
                    error!("could not record failure of operation {operation_id}: {queue_err}");
                }
                drop(guard);
                Err(e)
            }
        }
    }

    /// Cancel every order the instance tracks. Partial failure is fatal.
    ///
    /// Without a running instance the orders recorded in the last persisted
    /// snapshot are cancelled instead, limited to those the broker still
    /// reports open.
    fn cancel_instance_orders(
        &self,
        runtime: &mut dyn StrategyRuntime,
        strategy: &Strategy,
    ) -> Result<(), LifecycleError> {
        if let Some(engine) = runtime.instance_mut(strategy.id) {
            engine.refresh_open_orders()?;
            return engine.cancel_all_open_orders().map(|_| ());
        }

        let tracked = match &strategy.runtime_snapshot {
            Some(value) => serde_json::from_value::<EngineSnapshot>(value.clone())?.open_orders,
            None => Vec::new(),
        };
        if tracked.is_empty() {
            debug!(
                "[strategy {} {}] no running instance and no tracked orders",
                strategy.id, strategy.symbol
            );
            return Ok(());
        }
        let live = self.broker.get_open_orders(&strategy.symbol, self.env)?;
        let open: Vec<Order> = tracked
            .into_iter()
            .filter(|o| live.iter().any(|l| l.id == o.id && l.status.is_open()))
            .collect();
        if open.is_empty() {
            return Ok(());
        }
        let report = self
            .broker
            .cancel_open_entries(&strategy.symbol, &open, self.env)?;
        self.record(
            self.event(
                strategy.id,
                AuditKind::OrdersCancelled,
                format!(
                    "{} cancelled, {} failed",
                    report.succeeded.len(),
                    report.failed.len()
                ),
            )
            .with("succeeded", report.succeeded.clone())
            .with("failed", failures_value(&report.failed)),
        );
        if !report.is_complete() {
            return Err(LifecycleError::PartialCancellation {
                symbol: strategy.symbol.clone(),
                failures: report.failed,
            });
        }
        Ok(())
    }

    fn record_cancel_failure(
        &self,
        strategy_id: i64,
        kind: AuditKind,
        err: &LifecycleError,
        operation_id: i64,
    ) {
        let mut event = self
            .event(strategy_id, kind, err.to_string())
            .with("operation_id", operation_id);
        if let LifecycleError::PartialCancellation { failures, .. } = err {
            event = event.with("failures", failures_value(failures));
        }
        self.record(event);
    }

    /// Market out of any broker-reported position and wait until flat.
    fn flatten(&self, strategy_id: i64, symbol: &str) -> Result<(), LifecycleError> {
        let quantity = self.positions.net_quantity(symbol, true)?;
        if quantity.abs() < FLAT_EPSILON {
            return Ok(());
        }
        let plan = OrderPlan::market(symbol, Side::to_flatten(quantity), quantity.abs());
        info!(
            "[strategy {strategy_id} {symbol}] flattening {quantity} with {:?} market order",
            plan.side
        );
        self.broker.submit_order_plan(&plan, self.env)?;

        let deadline = Instant::now() + self.settings.flatten_timeout;
        loop {
            let remaining = self.positions.net_quantity(symbol, true)?;
            if remaining.abs() < FLAT_EPSILON {
                self.record(
                    self.event(strategy_id, AuditKind::PositionFlattened, symbol)
                        .with("quantity", quantity),
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::FlattenTimeout {
                    symbol: symbol.to_string(),
                    remaining,
                    timeout_ms: self.settings.flatten_timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.settings.flatten_poll);
        }
    }

    fn apply_swap(
        &self,
        runtime: &mut dyn StrategyRuntime,
        old: &Strategy,
        program: StrategyProgram,
        reason: &str,
        operation_id: i64,
    ) -> Result<LifecycleResult, LifecycleError> {
        Self::ensure_active(old)?;
        check_history_limit(&program, self.settings.max_history_limit)?;
        if let Err(e) = self.cancel_instance_orders(runtime, old) {
            self.record_cancel_failure(old.id, AuditKind::SwapFailed, &e, operation_id);
            return Err(e);
        }
        self.flatten(old.id, &old.symbol)?;

        let now = self.clock.now();
        let replacement = self
            .strategies
            .insert(&old.next_version(program), Some(old.lineage_id), now)?;

        if let Err(e) = runtime.swap_instance(old.id, replacement.clone()) {
            self.strategies
                .set_status(replacement.id, StrategyStatus::Failed, self.clock.now())?;
            self.record(
                self.event(old.id, AuditKind::SwapFailed, e.to_string())
                    .with("operation_id", operation_id)
                    .with("new_strategy_id", replacement.id),
            );
            return Err(LifecycleError::SwapFailed {
                new_id: replacement.id,
                reason: e.to_string(),
            });
        }

        let now = self.clock.now();
        self.strategies
            .set_status(replacement.id, StrategyStatus::Active, now)?;
        self.strategies.close(old.id, reason, now)?;
        info!(
            "[strategy {} {}] swapped to strategy {} (v{})",
            old.id, old.symbol, replacement.id, replacement.version
        );
        self.record(
            self.event(old.id, AuditKind::SwapCompleted, reason)
                .with("operation_id", operation_id)
                .with("new_strategy_id", replacement.id),
        );
        Ok(LifecycleResult::Swapped {
            old_strategy_id: old.id,
            new_strategy_id: replacement.id,
        })
    }

    fn apply_close(
        &self,
        runtime: &mut dyn StrategyRuntime,
        strategy: &Strategy,
        reason: &str,
        operation_id: i64,
    ) -> Result<LifecycleResult, LifecycleError> {
        Self::ensure_active(strategy)?;
        if let Err(e) = self.cancel_instance_orders(runtime, strategy) {
            self.record_cancel_failure(strategy.id, AuditKind::CloseFailed, &e, operation_id);
            return Err(e);
        }
        self.flatten(strategy.id, &strategy.symbol)?;
        self.strategies
            .close(strategy.id, reason, self.clock.now())?;
        runtime.remove_instance(strategy.id);
        info!("[strategy {} {}] closed: {reason}", strategy.id, strategy.symbol);
        self.record(
            self.event(strategy.id, AuditKind::StrategyClosed, reason)
                .with("operation_id", operation_id),
        );
        Ok(LifecycleResult::Closed {
            strategy_id: strategy.id,
            reason: reason.to_string(),
        })
    }

    /// Take the lifecycle lock for a strategy. `Ok(false)` on timeout.
    pub fn lock_strategy(&self, strategy_id: i64, timeout: Duration) -> Result<bool, LifecycleError> {
        self.locks.acquire(&strategy_lock_key(strategy_id), timeout)
    }

    pub fn unlock_strategy(&self, strategy_id: i64) -> Result<(), LifecycleError> {
        self.locks.release(&strategy_lock_key(strategy_id))
    }

    pub fn is_strategy_locked(&self, strategy_id: i64) -> Result<bool, LifecycleError> {
        self.locks.is_locked(&strategy_lock_key(strategy_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::program::TransitionDef;

    fn program(guard: &str) -> StrategyProgram {
        StrategyProgram {
            states: vec!["A".into(), "B".into()],
            initial_state: "A".into(),
            features: vec![],
            transitions: vec![TransitionDef {
                name: "go".into(),
                from: "A".into(),
                to: "B".into(),
                guard: guard.into(),
                actions: vec![],
            }],
            history_limit: 10,
        }
    }

    #[test]
    fn swap_key_depends_on_content() {
        let a = swap_key(1, "SPY", &program("close > 1")).unwrap();
        let b = swap_key(1, "SPY", &program("close > 1")).unwrap();
        let c = swap_key(1, "SPY", &program("close > 2")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("swap:1:SPY:"));
    }

    #[test]
    fn close_key_format() {
        assert_eq!(close_key(7, "QQQ"), "close:7:QQQ");
    }

    #[test]
    fn result_serializes_with_outcome_tag() {
        let value = serde_json::to_value(LifecycleResult::Swapped {
            old_strategy_id: 1,
            new_strategy_id: 2,
        })
        .unwrap();
        assert_eq!(value["outcome"], "swapped");
        assert_eq!(value["new_strategy_id"], 2);
    }
}
