//! Drives running strategy instances: loads them from the store, delivers
//! new bars, persists snapshots, drains the operation queue and periodically
//! asks the lifecycle manager to evaluate each instance.
//!
//! # Cycle
//!
//! 1. Stop instances whose record is no longer active; start pending and
//!    active records that have no instance yet
//! 2. Execute queued lifecycle operations left pending by earlier attempts
//! 3. For each instance, fetch bars after the last delivered one and deliver
//!    them live, oldest first
//! 4. Evaluate instances that have seen `evaluation_interval` bars since the
//!    last evaluation; evaluation errors are logged and do not stop the cycle

use crate::domain::bar::Bar;
use crate::domain::engine::{BarOutcome, EngineContext, EngineSnapshot, StrategyEngine};
use crate::domain::error::LifecycleError;
use crate::domain::lifecycle::{LifecycleManager, LifecycleOutcome, StrategyRuntime};
use crate::domain::queue::OperationQueue;
use crate::domain::strategy::{Strategy, StrategyStatus};
use crate::ports::data_port::BarSource;
use crate::ports::strategy_store_port::StrategyStore;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    /// Bars between evaluations of one instance. Zero disables evaluation.
    pub evaluation_interval: u64,
    pub poll_interval: Duration,
    pub max_operations_per_cycle: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        OrchestratorSettings {
            evaluation_interval: 10,
            poll_interval: Duration::from_secs(60),
            max_operations_per_cycle: 10,
        }
    }
}

struct Instance {
    engine: StrategyEngine,
    last_delivered: Option<DateTime<Utc>>,
    bars_since_evaluation: u64,
}

/// Running engines keyed by strategy id.
pub struct InstanceSet {
    ctx: EngineContext,
    instances: BTreeMap<i64, Instance>,
}

impl InstanceSet {
    pub fn new(ctx: EngineContext) -> Self {
        InstanceSet {
            ctx,
            instances: BTreeMap::new(),
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        self.instances.keys().copied().collect()
    }

    pub fn get(&self, strategy_id: i64) -> Option<&StrategyEngine> {
        self.instances.get(&strategy_id).map(|i| &i.engine)
    }

    pub fn contains(&self, strategy_id: i64) -> bool {
        self.instances.contains_key(&strategy_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn last_delivered(&self, strategy_id: i64) -> Option<DateTime<Utc>> {
        self.instances
            .get(&strategy_id)
            .and_then(|i| i.last_delivered)
    }

    /// Build an engine for `strategy`, replay `history` through it without
    /// broker effects, then adopt any persisted snapshot.
    pub fn start(&mut self, strategy: Strategy, history: &[Bar]) -> Result<(), LifecycleError> {
        let snapshot = match &strategy.runtime_snapshot {
            Some(value) => match serde_json::from_value::<EngineSnapshot>(value.clone()) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(
                        "[strategy {} {}] ignoring unreadable snapshot: {e}",
                        strategy.id, strategy.symbol
                    );
                    None
                }
            },
            None => None,
        };

        let id = strategy.id;
        let mut engine = StrategyEngine::new(strategy, self.ctx.clone())?;
        for bar in history {
            engine.process_bar(bar, true);
        }
        let mut last_delivered = history.last().map(|b| b.timestamp);
        if let Some(snapshot) = &snapshot {
            engine.restore(snapshot);
            last_delivered = last_delivered.max(snapshot.last_bar_at);
        }
        info!(
            "[strategy {id} {}] started in state '{}' after {} warm-up bar(s)",
            engine.symbol(),
            engine.state(),
            history.len()
        );
        self.instances.insert(
            id,
            Instance {
                engine,
                last_delivered,
                bars_since_evaluation: 0,
            },
        );
        Ok(())
    }
}

impl StrategyRuntime for InstanceSet {
    fn instance_mut(&mut self, strategy_id: i64) -> Option<&mut StrategyEngine> {
        self.instances.get_mut(&strategy_id).map(|i| &mut i.engine)
    }

    fn swap_instance(&mut self, old_id: i64, replacement: Strategy) -> Result<(), LifecycleError> {
        let old = self
            .instances
            .get(&old_id)
            .ok_or(LifecycleError::InstanceNotFound { id: old_id })?;
        let new_id = replacement.id;
        let mut engine = StrategyEngine::new(replacement, self.ctx.clone())?;
        for bar in old.engine.bars() {
            engine.process_bar(bar, true);
        }
        let last_delivered = old.last_delivered;
        debug!(
            "[strategy {new_id} {}] warmed up on {} bar(s) from strategy {old_id}",
            engine.symbol(),
            engine.bar_count()
        );
        self.instances.remove(&old_id);
        self.instances.insert(
            new_id,
            Instance {
                engine,
                last_delivered,
                bars_since_evaluation: 0,
            },
        );
        Ok(())
    }

    fn remove_instance(&mut self, strategy_id: i64) -> Option<StrategyEngine> {
        self.instances.remove(&strategy_id).map(|i| i.engine)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub started: usize,
    pub stopped: usize,
    pub operations: usize,
    pub bars_delivered: usize,
    pub transitions: usize,
    pub evaluations: Vec<(i64, LifecycleOutcome)>,
    pub errors: usize,
}

pub struct Orchestrator {
    strategies: Arc<dyn StrategyStore>,
    bars: Box<dyn BarSource>,
    queue: Arc<OperationQueue>,
    lifecycle: LifecycleManager,
    runtime: InstanceSet,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        strategies: Arc<dyn StrategyStore>,
        bars: Box<dyn BarSource>,
        queue: Arc<OperationQueue>,
        lifecycle: LifecycleManager,
        ctx: EngineContext,
        settings: OrchestratorSettings,
    ) -> Self {
        Orchestrator {
            strategies,
            bars,
            queue,
            lifecycle,
            runtime: InstanceSet::new(ctx),
            settings,
        }
    }

    pub fn instances(&self) -> &InstanceSet {
        &self.runtime
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    fn warmup_history(&self, strategy: &Strategy) -> Result<Vec<Bar>, LifecycleError> {
        let mut history = self
            .bars
            .fetch_bars(&strategy.symbol, &strategy.timeframe, None)?;
        let keep = strategy.program.history_limit;
        if history.len() > keep {
            history.drain(..history.len() - keep);
        }
        Ok(history)
    }

    fn start_instance(&mut self, strategy: Strategy) -> Result<(), LifecycleError> {
        let history = self.warmup_history(&strategy)?;
        self.runtime.start(strategy, &history)
    }

    /// Align running instances with the store. Returns (started, stopped).
    pub fn load_active(&mut self) -> Result<(usize, usize), LifecycleError> {
        let mut stopped = 0;
        for id in self.runtime.ids() {
            let status = self.strategies.get(id)?.map(|s| s.status);
            if status != Some(StrategyStatus::Active) {
                info!("strategy {id} is {status:?}, stopping its instance");
                self.runtime.remove_instance(id);
                stopped += 1;
            }
        }

        let mut started = 0;
        let mut candidates = self.strategies.list_by_status(StrategyStatus::Active)?;
        candidates.extend(self.strategies.list_by_status(StrategyStatus::Pending)?);
        for strategy in candidates {
            if self.runtime.contains(strategy.id) {
                continue;
            }
            let id = strategy.id;
            let was_pending = strategy.status == StrategyStatus::Pending;
            match self.start_instance(strategy) {
                Ok(()) => {
                    if was_pending {
                        self.strategies
                            .set_status(id, StrategyStatus::Active, self.now())?;
                    }
                    started += 1;
                }
                Err(e @ (LifecycleError::ProgramInvalid { .. }
                | LifecycleError::ExprParse(_)
                | LifecycleError::Eval(_))) => {
                    error!("strategy {id} cannot run: {e}");
                    self.strategies
                        .set_status(id, StrategyStatus::Failed, self.now())?;
                }
                Err(e) => {
                    error!("strategy {id} failed to start, will retry: {e}");
                }
            }
        }
        Ok((started, stopped))
    }

    fn now(&self) -> DateTime<Utc> {
        self.runtime.ctx.clock.now()
    }

    /// Deliver one live bar. Bars not strictly newer than the last delivered
    /// bar, or for another symbol, are dropped and yield `Ok(None)`.
    pub fn deliver_bar(
        &mut self,
        strategy_id: i64,
        bar: &Bar,
    ) -> Result<Option<BarOutcome>, LifecycleError> {
        let instance = self
            .runtime
            .instances
            .get_mut(&strategy_id)
            .ok_or(LifecycleError::InstanceNotFound { id: strategy_id })?;
        if bar.symbol != instance.engine.symbol() {
            warn!(
                "[strategy {strategy_id} {}] dropping bar for {}",
                instance.engine.symbol(),
                bar.symbol
            );
            return Ok(None);
        }
        if let Some(last) = instance.last_delivered {
            if bar.timestamp <= last {
                debug!(
                    "[strategy {strategy_id} {}] dropping bar at {} (last {last})",
                    bar.symbol, bar.timestamp
                );
                return Ok(None);
            }
        }

        let outcome = instance.engine.process_bar(bar, false);
        instance.last_delivered = Some(bar.timestamp);
        instance.bars_since_evaluation += 1;

        let snapshot = serde_json::to_value(instance.engine.snapshot())?;
        if let Err(e) = self.strategies.save_snapshot(strategy_id, &snapshot) {
            warn!("[strategy {strategy_id} {}] snapshot not saved: {e}", bar.symbol);
        }
        Ok(Some(outcome))
    }

    /// Execute up to `max_operations_per_cycle` queued operations.
    pub fn process_operations(&mut self) -> usize {
        let mut processed = 0;
        while processed < self.settings.max_operations_per_cycle {
            let operation = match self.queue.dequeue() {
                Ok(Some(operation)) => operation,
                Ok(None) => break,
                Err(e) => {
                    error!("dequeue failed: {e}");
                    break;
                }
            };
            processed += 1;
            match self.lifecycle.process_claimed(&mut self.runtime, &operation) {
                Ok(outcome) => info!(
                    "operation {} ({}) processed: {outcome:?}",
                    operation.id, operation.idempotency_key
                ),
                Err(e) => error!(
                    "operation {} ({}) failed: {e}",
                    operation.id, operation.idempotency_key
                ),
            }
        }
        processed
    }

    fn evaluation_due(&self, strategy_id: i64) -> bool {
        self.settings.evaluation_interval > 0
            && self
                .runtime
                .instances
                .get(&strategy_id)
                .is_some_and(|i| i.bars_since_evaluation >= self.settings.evaluation_interval)
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        match self.load_active() {
            Ok((started, stopped)) => {
                report.started = started;
                report.stopped = stopped;
            }
            Err(e) => {
                error!("loading strategies failed: {e}");
                report.errors += 1;
            }
        }
        report.operations = self.process_operations();

        for id in self.runtime.ids() {
            let Some(engine) = self.runtime.get(id) else {
                continue;
            };
            let fetched = self.bars.fetch_bars(
                engine.symbol(),
                &engine.strategy().timeframe,
                self.runtime.last_delivered(id),
            );
            let bars = match fetched {
                Ok(bars) => bars,
                Err(e) => {
                    warn!("[strategy {id}] bar fetch failed: {e}");
                    report.errors += 1;
                    continue;
                }
            };
            for bar in &bars {
                match self.deliver_bar(id, bar) {
                    Ok(Some(outcome)) => {
                        report.bars_delivered += 1;
                        if outcome.transition.is_some() {
                            report.transitions += 1;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("[strategy {id}] bar delivery failed: {e}");
                        report.errors += 1;
                    }
                }
            }

            if self.evaluation_due(id) {
                if let Some(instance) = self.runtime.instances.get_mut(&id) {
                    instance.bars_since_evaluation = 0;
                }
                match self.lifecycle.evaluate_strategy(&mut self.runtime, id) {
                    Ok(outcome) => report.evaluations.push((id, outcome)),
                    Err(e) => {
                        error!("[strategy {id}] evaluation failed: {e}");
                        report.errors += 1;
                    }
                }
            }
        }
        report
    }

    /// Recover expired leases, then cycle until `stop` is set or
    /// `max_cycles` have run. Returns the number of cycles run.
    pub fn run(&mut self, stop: &AtomicBool, max_cycles: Option<u64>) -> Result<u64, LifecycleError> {
        self.queue.release_stuck_locks()?;
        let mut cycles = 0;
        while !stop.load(Ordering::SeqCst) {
            let report = self.run_cycle();
            cycles += 1;
            debug!("cycle {cycles}: {report:?}");
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            thread::sleep(self.settings.poll_interval);
        }
        info!(
            "orchestrator stopped after {cycles} cycle(s) with {} instance(s) running",
            self.runtime.len()
        );
        Ok(cycles)
    }
}
