//! Per-strategy finite-state machine.
//!
//! # Bar Processing
//!
//! 1. Append the bar to the bounded bar history
//! 2. Recompute features in declaration order (builtins first)
//! 3. Advance active timers by one bar
//! 4. Evaluate transitions leaving the current state in declaration order and
//!    apply the first whose guard is true; at most one fires per bar
//! 5. Execute the fired transition's actions; each action's failure is caught
//!    and logged without affecting the state change
//!
//! In replay mode order submission and cancellation are replaced by a
//! `replay_suppressed` audit record. Everything else runs unchanged.
//!
//! An engine is not safe for concurrent bar delivery; the orchestrator owns
//! each instance exclusively.

use crate::domain::audit::{AuditEvent, AuditKind};
use crate::domain::bar::Bar;
use crate::domain::error::LifecycleError;
use crate::domain::expr::Expr;
use crate::domain::expr_eval::{evaluate_guard, evaluate_number};
use crate::domain::feature::FeatureFrame;
use crate::domain::order::{CancelReport, EntryType, Order, OrderPlan, TradingEnv, failures_value};
use crate::domain::program::{CompiledAction, CompiledProgram, PlanTemplate, compile};
use crate::domain::risk::{GuardRejection, KillSwitch, RiskContext, RiskLimits, check_order_plan};
use crate::domain::strategy::Strategy;
use crate::ports::audit_port::AuditSink;
use crate::ports::broker_port::BrokerPort;
use crate::ports::clock_port::Clock;
use crate::ports::portfolio_port::PositionSource;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

/// Collaborators shared by every engine instance in a process.
#[derive(Clone)]
pub struct EngineContext {
    pub broker: Arc<dyn BrokerPort>,
    pub positions: Arc<dyn PositionSource>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub env: TradingEnv,
    pub limits: RiskLimits,
    pub kill_switch: KillSwitch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTransition {
    pub name: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Executed { action: &'static str },
    Suppressed { action: &'static str },
    Rejected {
        action: &'static str,
        rejection: GuardRejection,
    },
    Failed {
        action: &'static str,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarOutcome {
    pub transition: Option<FiredTransition>,
    pub actions: Vec<ActionOutcome>,
}

/// Serializable view of an instance, persisted for cross-process visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub strategy_id: i64,
    pub state: String,
    pub bar_count: u64,
    pub last_bar_at: Option<DateTime<Utc>>,
    pub features: BTreeMap<String, f64>,
    pub timers: BTreeMap<String, u32>,
    pub open_orders: Vec<Order>,
}

pub struct StrategyEngine {
    strategy: Strategy,
    program: CompiledProgram,
    ctx: EngineContext,
    state: String,
    bar_count: u64,
    bars: VecDeque<Bar>,
    frame: FeatureFrame,
    open_orders: Vec<Order>,
}

impl StrategyEngine {
    pub fn new(strategy: Strategy, ctx: EngineContext) -> Result<Self, LifecycleError> {
        let program = compile(&strategy.program)?;
        let limit = program.history_limit();
        Ok(StrategyEngine {
            state: program.initial_state().to_string(),
            frame: FeatureFrame::new(limit),
            bars: VecDeque::new(),
            bar_count: 0,
            open_orders: Vec::new(),
            strategy,
            program,
            ctx,
        })
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn strategy_id(&self) -> i64 {
        self.strategy.id
    }

    pub fn symbol(&self) -> &str {
        &self.strategy.symbol
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn bar_count(&self) -> u64 {
        self.bar_count
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.back()
    }

    /// Retained bars, oldest first.
    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    pub fn frame(&self) -> &FeatureFrame {
        &self.frame
    }

    pub fn open_orders(&self) -> &[Order] {
        &self.open_orders
    }

    /// Seed tracked orders, e.g. from a persisted snapshot after a restart.
    pub fn restore_open_orders(&mut self, orders: Vec<Order>) {
        self.open_orders = orders.into_iter().filter(|o| o.status.is_open()).collect();
    }

    /// Resume from a persisted snapshot taken by an earlier process.
    ///
    /// State and timers are adopted only if this program still declares
    /// them; features are not restored and rebuild from bar history.
    pub fn restore(&mut self, snapshot: &EngineSnapshot) {
        if self.program.source.states.iter().any(|s| *s == snapshot.state) {
            self.state = snapshot.state.clone();
        } else {
            warn!(
                "[strategy {} {}] snapshot state '{}' not in program, keeping '{}'",
                self.strategy.id, self.strategy.symbol, snapshot.state, self.state
            );
        }
        for (name, remaining) in &snapshot.timers {
            self.frame.start_timer(name, *remaining);
        }
        self.restore_open_orders(snapshot.open_orders.clone());
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            strategy_id: self.strategy.id,
            state: self.state.clone(),
            bar_count: self.bar_count,
            last_bar_at: self.last_bar().map(|b| b.timestamp),
            features: self.frame.snapshot(),
            timers: self.frame.timers().clone(),
            open_orders: self.open_orders.clone(),
        }
    }

    fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.ctx.audit.record(&event) {
            warn!(
                "[strategy {} {}] audit write failed ({}): {e}",
                self.strategy.id,
                self.strategy.symbol,
                event.kind.as_str()
            );
        }
    }

    fn event(&self, kind: AuditKind, message: impl Into<String>) -> AuditEvent {
        AuditEvent::new(Some(self.strategy.id), kind, message, self.ctx.clock.now())
    }

    pub fn process_bar(&mut self, bar: &Bar, replay: bool) -> BarOutcome {
        let id = self.strategy.id;
        self.bars.push_back(bar.clone());
        while self.bars.len() > self.program.history_limit() {
            self.bars.pop_front();
        }
        self.bar_count += 1;

        for (feature, err) in self.frame.compute(bar, &self.program.features) {
            warn!("[strategy {id} {}] feature '{feature}' failed: {err}", bar.symbol);
        }
        self.frame.tick_timers();

        let mut fired = None;
        for (index, transition) in self.program.transitions.iter().enumerate() {
            if transition.from != self.state {
                continue;
            }
            match evaluate_guard(&transition.guard, &self.frame) {
                Ok(true) => {
                    fired = Some(index);
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "[strategy {id} {}] guard of '{}' failed to evaluate: {e}",
                    bar.symbol, transition.name
                ),
            }
        }

        let Some(index) = fired else {
            return BarOutcome::default();
        };
        let transition = self.program.transitions[index].clone();
        info!(
            "[strategy {id} {}] {} -> {} via '{}'{}",
            bar.symbol,
            transition.from,
            transition.to,
            transition.name,
            if replay { " (replay)" } else { "" }
        );
        self.state = transition.to.clone();
        self.audit(
            self.event(
                AuditKind::Transition,
                format!("{} -> {}", transition.from, transition.to),
            )
            .with("transition", transition.name.clone())
            .with("replay", replay)
            .with("bar_at", bar.timestamp.to_rfc3339()),
        );

        let actions = transition
            .actions
            .iter()
            .map(|action| self.execute_action(action, bar, replay))
            .collect();

        BarOutcome {
            transition: Some(FiredTransition {
                name: transition.name,
                from: transition.from,
                to: transition.to,
            }),
            actions,
        }
    }

    fn execute_action(&mut self, action: &CompiledAction, bar: &Bar, replay: bool) -> ActionOutcome {
        let label = action.label();
        if replay && action.has_broker_effect() {
            let mut event = self.event(
                AuditKind::ReplaySuppressed,
                format!("{label} suppressed during replay"),
            );
            if let CompiledAction::SubmitOrderPlan(template) = action {
                match self.build_plan(template) {
                    Ok(plan) => {
                        if let Ok(value) = serde_json::to_value(&plan) {
                            event = event.with("plan", value);
                        }
                    }
                    Err(e) => event = event.with("plan_error", e.to_string()),
                }
            }
            self.audit(event);
            return ActionOutcome::Suppressed { action: label };
        }

        let result = match action {
            CompiledAction::SubmitOrderPlan(template) => self.submit_order_plan(template, bar),
            CompiledAction::CancelOpenOrders => self.cancel_all_open_orders().map(|_| None),
            CompiledAction::StartTimer { name, bars } => {
                self.frame.start_timer(name, *bars);
                Ok(None)
            }
            CompiledAction::CancelTimer { name } => {
                if !self.frame.cancel_timer(name) {
                    debug!(
                        "[strategy {} {}] cancel of inactive timer '{name}'",
                        self.strategy.id, self.strategy.symbol
                    );
                }
                Ok(None)
            }
            CompiledAction::Log { message } => {
                info!(
                    "[strategy {} {}] {message}",
                    self.strategy.id, self.strategy.symbol
                );
                Ok(None)
            }
        };

        match result {
            Ok(None) => ActionOutcome::Executed { action: label },
            Ok(Some(rejection)) => {
                warn!(
                    "[strategy {} {}] {label} rejected by {}: {}",
                    self.strategy.id, self.strategy.symbol, rejection.check, rejection.message
                );
                let mut event = self.event(AuditKind::GuardRejected, rejection.message.clone());
                if let Ok(value) = serde_json::to_value(&rejection) {
                    event = event.with("rejection", value);
                }
                self.audit(event);
                ActionOutcome::Rejected {
                    action: label,
                    rejection,
                }
            }
            Err(e) => {
                warn!(
                    "[strategy {} {}] action {label} failed: {e}",
                    self.strategy.id, self.strategy.symbol
                );
                self.audit(
                    self.event(AuditKind::ActionFailed, e.to_string())
                        .with("action", label),
                );
                ActionOutcome::Failed {
                    action: label,
                    error: e.to_string(),
                }
            }
        }
    }

    fn build_plan(&self, template: &PlanTemplate) -> Result<OrderPlan, LifecycleError> {
        let eval = |expr: &Option<Expr>| -> Result<Option<f64>, LifecycleError> {
            Ok(match expr {
                Some(e) => Some(evaluate_number(e, &self.frame)?),
                None => None,
            })
        };
        let entry = match eval(&template.limit_price)? {
            Some(price) => EntryType::Limit { price },
            None => EntryType::Market,
        };
        Ok(OrderPlan {
            symbol: self.strategy.symbol.clone(),
            side: template.side,
            quantity: template.quantity,
            entry,
            stop_loss: eval(&template.stop_loss)?,
            take_profit: eval(&template.take_profit)?,
        })
    }

    /// Run the risk cascade, cancel this instance's open orders, then submit.
    /// `Ok(Some(_))` is a guard rejection; nothing was sent to the broker.
    fn submit_order_plan(
        &mut self,
        template: &PlanTemplate,
        bar: &Bar,
    ) -> Result<Option<GuardRejection>, LifecycleError> {
        let plan = self.build_plan(template)?;
        let own: HashSet<&str> = self.open_orders.iter().map(|o| o.id.as_str()).collect();
        let other_open_orders = self
            .ctx
            .broker
            .get_open_orders(&plan.symbol, self.ctx.env)?
            .iter()
            .filter(|o| o.status.is_open() && !own.contains(o.id.as_str()))
            .count();
        let risk = RiskContext {
            daily_pnl: self.ctx.positions.daily_pnl()?,
            other_open_orders,
            reference_price: bar.close,
        };
        if let Err(rejection) =
            check_order_plan(&self.ctx.limits, &self.ctx.kill_switch, &plan, &risk)
        {
            return Ok(Some(rejection));
        }

        self.cancel_all_open_orders()?;

        let orders = self.ctx.broker.submit_order_plan(&plan, self.ctx.env)?;
        info!(
            "[strategy {} {}] submitted {:?} {} ({} order(s))",
            self.strategy.id,
            self.strategy.symbol,
            plan.side,
            plan.quantity,
            orders.len()
        );
        let mut event = self
            .event(AuditKind::OrderSubmitted, format!("{:?} {}", plan.side, plan.quantity))
            .with(
                "order_ids",
                orders.iter().map(|o| o.id.clone()).collect::<Vec<_>>(),
            );
        if let Ok(value) = serde_json::to_value(&plan) {
            event = event.with("plan", value);
        }
        self.audit(event);
        self.open_orders
            .extend(orders.into_iter().filter(|o| o.status.is_open()));
        Ok(None)
    }

    /// Cancel every order this instance tracks. Successfully cancelled orders
    /// are forgotten; any failure yields `PartialCancellation`.
    pub fn cancel_all_open_orders(&mut self) -> Result<CancelReport, LifecycleError> {
        if self.open_orders.is_empty() {
            return Ok(CancelReport::default());
        }
        let report = self.ctx.broker.cancel_open_entries(
            &self.strategy.symbol,
            &self.open_orders,
            self.ctx.env,
        )?;
        let cancelled: HashSet<&str> = report.succeeded.iter().map(String::as_str).collect();
        self.open_orders.retain(|o| !cancelled.contains(o.id.as_str()));
        self.audit(
            self.event(
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
                symbol: self.strategy.symbol.clone(),
                failures: report.failed.clone(),
            });
        }
        Ok(report)
    }

    /// Drop tracked orders the broker no longer reports as open.
    pub fn refresh_open_orders(&mut self) -> Result<(), LifecycleError> {
        if self.open_orders.is_empty() {
            return Ok(());
        }
        let live = self
            .ctx
            .broker
            .get_open_orders(&self.strategy.symbol, self.ctx.env)?;
        let before = self.open_orders.len();
        self.open_orders.retain_mut(|tracked| {
            match live.iter().find(|o| o.id == tracked.id && o.status.is_open()) {
                Some(current) => {
                    tracked.status = current.status;
                    true
                }
                None => false,
            }
        });
        if self.open_orders.len() != before {
            debug!(
                "[strategy {} {}] {} tracked order(s) no longer open",
                self.strategy.id,
                self.strategy.symbol,
                before - self.open_orders.len()
            );
        }
        Ok(())
    }
}
