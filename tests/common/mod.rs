#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use stratlife::adapters::memory_lock::MemoryLockRegistry;
use stratlife::adapters::sqlite::SqliteAdapter;
use stratlife::domain::audit::{AuditEvent, AuditKind};
use stratlife::domain::bar::Bar;
use stratlife::domain::engine::EngineContext;
use stratlife::domain::error::LifecycleError;
use stratlife::domain::evaluation::{Evaluation, EvaluationRequest};
use stratlife::domain::lifecycle::{LifecycleDeps, LifecycleManager, LifecycleSettings};
use stratlife::domain::lock::LockService;
use stratlife::domain::order::{
    CancelFailure, CancelReport, EntryType, Order, OrderPlan, OrderStatus, Side, TradingEnv,
};
use stratlife::domain::orchestrator::InstanceSet;
use stratlife::domain::program::{ActionDef, StrategyProgram, TransitionDef};
use stratlife::domain::queue::{OperationQueue, QueueSettings};
use stratlife::domain::risk::{KillSwitch, RiskLimits};
use stratlife::domain::strategy::{NewStrategy, Strategy, StrategyStatus};
use stratlife::ports::audit_port::AuditSink;
use stratlife::ports::broker_port::BrokerPort;
use stratlife::ports::clock_port::Clock;
use stratlife::ports::data_port::BarSource;
use stratlife::ports::evaluator_port::Evaluator;
use stratlife::ports::portfolio_port::PositionSource;
use stratlife::ports::strategy_store_port::StrategyStore;

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn bar(symbol: &str, minute: i64, close: f64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timestamp: t0() + Duration::minutes(minute),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1000.0,
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedPortfolio {
    quantities: Mutex<HashMap<String, f64>>,
    pub pnl: Mutex<f64>,
    pub fresh_reads: Mutex<usize>,
}

impl ScriptedPortfolio {
    pub fn set(&self, symbol: &str, quantity: f64) {
        self.quantities
            .lock()
            .unwrap()
            .insert(symbol.to_string(), quantity);
    }

    pub fn adjust(&self, symbol: &str, delta: f64) {
        *self
            .quantities
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_insert(0.0) += delta;
    }

    pub fn get(&self, symbol: &str) -> f64 {
        self.quantities
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(0.0)
    }
}

impl PositionSource for ScriptedPortfolio {
    fn net_quantity(&self, symbol: &str, fresh: bool) -> Result<f64, LifecycleError> {
        if fresh {
            *self.fresh_reads.lock().unwrap() += 1;
        }
        Ok(self.get(symbol))
    }

    fn daily_pnl(&self) -> Result<f64, LifecycleError> {
        Ok(*self.pnl.lock().unwrap())
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Records every call. Order ids listed in `fail_cancel` refuse to cancel.
/// When linked to a portfolio, market orders fill immediately unless
/// `hold_fills` is set.
#[derive(Default)]
pub struct RecordingBroker {
    pub submits: Mutex<Vec<OrderPlan>>,
    pub cancel_calls: Mutex<Vec<Vec<String>>>,
    pub fail_cancel: Mutex<HashSet<String>>,
    pub hold_fills: Mutex<bool>,
    orders: Mutex<Vec<Order>>,
    portfolio: Option<Arc<ScriptedPortfolio>>,
}

impl RecordingBroker {
    pub fn linked(portfolio: Arc<ScriptedPortfolio>) -> Self {
        Self {
            portfolio: Some(portfolio),
            ..Self::default()
        }
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    pub fn fail_cancel_of(&self, order_id: &str) {
        self.fail_cancel.lock().unwrap().insert(order_id.to_string());
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        self.orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.status.is_open())
            .map(|o| o.id.clone())
            .collect()
    }
}

impl BrokerPort for RecordingBroker {
    fn submit_order_plan(&self, plan: &OrderPlan, _env: TradingEnv) -> Result<Vec<Order>, LifecycleError> {
        self.submits.lock().unwrap().push(plan.clone());
        let mut orders = self.orders.lock().unwrap();
        let id = format!("ord-{}", orders.len() + 1);
        let fills = plan.entry == EntryType::Market && !*self.hold_fills.lock().unwrap();
        let status = match (&self.portfolio, fills) {
            (Some(portfolio), true) => {
                let signed = match plan.side {
                    Side::Buy => plan.quantity,
                    Side::Sell => -plan.quantity,
                };
                portfolio.adjust(&plan.symbol, signed);
                OrderStatus::Filled
            }
            _ => OrderStatus::Working,
        };
        let order = Order {
            id,
            symbol: plan.symbol.clone(),
            side: plan.side,
            quantity: plan.quantity,
            status,
        };
        orders.push(order.clone());
        Ok(vec![order])
    }

    fn cancel_open_entries(
        &self,
        _symbol: &str,
        orders: &[Order],
        _env: TradingEnv,
    ) -> Result<CancelReport, LifecycleError> {
        self.cancel_calls
            .lock()
            .unwrap()
            .push(orders.iter().map(|o| o.id.clone()).collect());
        let refuse = self.fail_cancel.lock().unwrap();
        let mut book = self.orders.lock().unwrap();
        let mut report = CancelReport::default();
        for order in orders {
            if refuse.contains(&order.id) {
                report.failed.push(CancelFailure {
                    order_id: order.id.clone(),
                    reason: "broker refused cancel".into(),
                });
                continue;
            }
            if let Some(tracked) = book.iter_mut().find(|o| o.id == order.id) {
                tracked.status = OrderStatus::Cancelled;
            }
            report.succeeded.push(order.id.clone());
        }
        Ok(report)
    }

    fn get_open_orders(&self, symbol: &str, _env: TradingEnv) -> Result<Vec<Order>, LifecycleError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.symbol == symbol && o.status.is_open())
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Evaluator and audit
// ---------------------------------------------------------------------------

/// Returns queued evaluations in order, then `keep`.
#[derive(Default)]
pub struct ScriptedEvaluator {
    pub script: Mutex<VecDeque<Evaluation>>,
    pub requests: Mutex<Vec<EvaluationRequest>>,
}

impl ScriptedEvaluator {
    pub fn push(&self, evaluation: Evaluation) {
        self.script.lock().unwrap().push_back(evaluation);
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Evaluation, LifecycleError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Evaluation::keep("scripted keep")))
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn kinds(&self) -> Vec<AuditKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: &AuditEvent) -> Result<(), LifecycleError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------------

/// In-memory bar feed; `push` makes bars visible to the next fetch.
#[derive(Default, Clone)]
pub struct MemoryBars {
    bars: Arc<Mutex<Vec<Bar>>>,
}

impl MemoryBars {
    pub fn push(&self, bar: Bar) {
        self.bars.lock().unwrap().push(bar);
    }
}

impl BarSource for MemoryBars {
    fn fetch_bars(
        &self,
        symbol: &str,
        _timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError> {
        Ok(self
            .bars
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.symbol == symbol && since.is_none_or(|s| b.timestamp > s))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

pub fn buy(quantity: f64) -> ActionDef {
    ActionDef::SubmitOrderPlan {
        side: Side::Buy,
        quantity,
        limit_price: None,
        stop_loss: None,
        take_profit: None,
    }
}

pub fn limit_buy(quantity: f64, price: &str) -> ActionDef {
    ActionDef::SubmitOrderPlan {
        side: Side::Buy,
        quantity,
        limit_price: Some(price.to_string()),
        stop_loss: None,
        take_profit: None,
    }
}

/// WAITING -> ARMED when `close > threshold`, running `actions`.
pub fn breakout(threshold: f64, actions: Vec<ActionDef>) -> StrategyProgram {
    StrategyProgram {
        states: vec!["WAITING".into(), "ARMED".into()],
        initial_state: "WAITING".into(),
        features: vec![],
        transitions: vec![TransitionDef {
            name: "arm".into(),
            from: "WAITING".into(),
            to: "ARMED".into(),
            guard: format!("close > {threshold}"),
            actions,
        }],
        history_limit: 50,
    }
}

pub fn new_strategy(symbol: &str, program: StrategyProgram) -> NewStrategy {
    NewStrategy {
        name: "breakout".into(),
        owner: "tests".into(),
        symbol: symbol.to_string(),
        timeframe: "1m".into(),
        program,
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub db: Arc<SqliteAdapter>,
    pub clock: Arc<ManualClock>,
    pub broker: Arc<RecordingBroker>,
    pub portfolio: Arc<ScriptedPortfolio>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub audit: Arc<RecordingAudit>,
    pub registry: MemoryLockRegistry,
    pub locks: Arc<LockService>,
    pub queue: Arc<OperationQueue>,
}

impl Harness {
    pub fn new() -> Self {
        let db = Arc::new(SqliteAdapter::in_memory().unwrap());
        db.initialize_schema().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let portfolio = Arc::new(ScriptedPortfolio::default());
        let broker = Arc::new(RecordingBroker::linked(portfolio.clone()));
        let registry = MemoryLockRegistry::new();
        let locks = Arc::new(LockService::new(Arc::new(registry.session())));
        let queue = Arc::new(OperationQueue::new(
            db.clone(),
            clock.clone(),
            QueueSettings::default(),
        ));
        Self {
            db,
            clock,
            broker,
            portfolio,
            evaluator: Arc::new(ScriptedEvaluator::default()),
            audit: Arc::new(RecordingAudit::default()),
            registry,
            locks,
            queue,
        }
    }

    pub fn ctx(&self) -> EngineContext {
        EngineContext {
            broker: self.broker.clone(),
            positions: self.portfolio.clone(),
            audit: self.audit.clone(),
            clock: self.clock.clone(),
            env: TradingEnv::Paper,
            limits: RiskLimits::default(),
            kill_switch: KillSwitch::new(false),
        }
    }

    pub fn settings() -> LifecycleSettings {
        LifecycleSettings {
            lock_timeout: std::time::Duration::from_millis(50),
            flatten_timeout: std::time::Duration::from_millis(100),
            flatten_poll: std::time::Duration::from_millis(10),
            min_confidence: 0.0,
            max_history_limit: 1000,
        }
    }

    pub fn lifecycle(&self) -> LifecycleManager {
        self.lifecycle_with(Self::settings())
    }

    pub fn lifecycle_with(&self, settings: LifecycleSettings) -> LifecycleManager {
        LifecycleManager::new(
            LifecycleDeps {
                strategies: self.db.clone(),
                queue: self.queue.clone(),
                locks: self.locks.clone(),
                broker: self.broker.clone(),
                positions: self.portfolio.clone(),
                evaluator: self.evaluator.clone(),
                audit: self.audit.clone(),
                clock: self.clock.clone(),
                env: TradingEnv::Paper,
            },
            settings,
        )
    }

    /// A second process-local lock service contending for the same ids.
    pub fn rival_locks(&self) -> LockService {
        LockService::new(Arc::new(self.registry.session()))
    }

    pub fn register_active(&self, symbol: &str, program: StrategyProgram) -> Strategy {
        let strategy = self
            .db
            .insert(&new_strategy(symbol, program), None, self.clock.now())
            .unwrap();
        self.db
            .set_status(strategy.id, StrategyStatus::Active, self.clock.now())
            .unwrap();
        self.db.get(strategy.id).unwrap().unwrap()
    }

    /// Runtime with one running instance of `strategy`.
    pub fn runtime_with(&self, strategy: &Strategy) -> InstanceSet {
        let mut runtime = InstanceSet::new(self.ctx());
        runtime.start(strategy.clone(), &[]).unwrap();
        runtime
    }
}
