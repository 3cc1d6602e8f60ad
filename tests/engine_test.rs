//! Strategy engine behaviour against recording collaborators.
//!
//! Tests cover:
//! - Live vs replay action execution on a guarded transition
//! - Risk checks and the kill switch
//! - Guards stay quiet while indicators warm up
//! - Snapshot restore and open-order tracking
//! - At most one transition per bar (property)

mod common;

use common::*;
use proptest::prelude::*;
use std::sync::Arc;
use stratlife::domain::audit::AuditKind;
use stratlife::domain::engine::{ActionOutcome, EngineContext, StrategyEngine};
use stratlife::domain::feature::{FeatureDef, FeatureKind};
use stratlife::domain::program::{StrategyProgram, TransitionDef};
use stratlife::domain::risk::{KillSwitch, RiskCheck, RiskLimits};
use stratlife::domain::strategy::{Strategy, StrategyStatus};
use stratlife::domain::order::TradingEnv;

fn strategy(program: StrategyProgram) -> Strategy {
    Strategy {
        id: 7,
        lineage_id: 7,
        version: 1,
        name: "breakout".into(),
        owner: "tests".into(),
        symbol: "SPY".into(),
        timeframe: "1m".into(),
        status: StrategyStatus::Active,
        program,
        activated_at: None,
        closed_at: None,
        close_reason: None,
        runtime_snapshot: None,
        created_at: t0(),
    }
}

struct Rig {
    broker: Arc<RecordingBroker>,
    portfolio: Arc<ScriptedPortfolio>,
    audit: Arc<RecordingAudit>,
}

impl Rig {
    fn new() -> Self {
        let portfolio = Arc::new(ScriptedPortfolio::default());
        Self {
            broker: Arc::new(RecordingBroker::linked(portfolio.clone())),
            portfolio,
            audit: Arc::new(RecordingAudit::default()),
        }
    }

    fn ctx(&self, limits: RiskLimits, kill_switch: KillSwitch) -> EngineContext {
        EngineContext {
            broker: self.broker.clone(),
            positions: self.portfolio.clone(),
            audit: self.audit.clone(),
            clock: Arc::new(ManualClock::new(t0())),
            env: TradingEnv::Paper,
            limits,
            kill_switch,
        }
    }

    fn engine(&self, program: StrategyProgram) -> StrategyEngine {
        StrategyEngine::new(
            strategy(program),
            self.ctx(RiskLimits::default(), KillSwitch::new(false)),
        )
        .unwrap()
    }
}

mod breakout_scenario {
    use super::*;

    #[test]
    fn live_bar_submits_exactly_one_plan() {
        let rig = Rig::new();
        let mut engine = rig.engine(breakout(100.0, vec![buy(10.0)]));

        let first = engine.process_bar(&bar("SPY", 0, 99.0), false);
        assert!(first.transition.is_none());
        assert_eq!(engine.state(), "WAITING");

        let second = engine.process_bar(&bar("SPY", 1, 101.0), false);
        let fired = second.transition.unwrap();
        assert_eq!((fired.from.as_str(), fired.to.as_str()), ("WAITING", "ARMED"));
        assert_eq!(
            second.actions,
            vec![ActionOutcome::Executed {
                action: "submit_order_plan"
            }]
        );
        assert_eq!(rig.broker.submit_count(), 1);
        assert_eq!(rig.portfolio.get("SPY"), 10.0);
        assert_eq!(rig.audit.count(AuditKind::Transition), 1);
        assert_eq!(rig.audit.count(AuditKind::OrderSubmitted), 1);
    }

    #[test]
    fn replay_transitions_without_broker_calls() {
        let rig = Rig::new();
        let mut engine = rig.engine(breakout(100.0, vec![buy(10.0)]));

        engine.process_bar(&bar("SPY", 0, 99.0), true);
        let outcome = engine.process_bar(&bar("SPY", 1, 101.0), true);

        assert_eq!(engine.state(), "ARMED");
        assert_eq!(
            outcome.actions,
            vec![ActionOutcome::Suppressed {
                action: "submit_order_plan"
            }]
        );
        assert_eq!(rig.broker.submit_count(), 0);
        assert_eq!(rig.audit.count(AuditKind::ReplaySuppressed), 1);
    }

    #[test]
    fn limit_entries_are_tracked_until_cancelled() {
        let rig = Rig::new();
        let mut engine = rig.engine(breakout(100.0, vec![limit_buy(5.0, "close - 1")]));
        engine.process_bar(&bar("SPY", 0, 101.0), false);

        assert_eq!(engine.open_orders().len(), 1);
        let report = engine.cancel_all_open_orders().unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert!(engine.open_orders().is_empty());
    }

    #[test]
    fn failed_cancel_keeps_order_tracked() {
        let rig = Rig::new();
        let mut engine = rig.engine(breakout(100.0, vec![limit_buy(5.0, "close - 1")]));
        engine.process_bar(&bar("SPY", 0, 101.0), false);
        let id = engine.open_orders()[0].id.clone();
        rig.broker.fail_cancel_of(&id);

        assert!(engine.cancel_all_open_orders().is_err());
        assert_eq!(engine.open_orders().len(), 1);
    }
}

mod warm_up {
    use super::*;

    fn inequality_program() -> StrategyProgram {
        let mut program = breakout(0.0, vec![buy(1.0)]);
        program.features = vec![FeatureDef {
            name: "sma3".into(),
            kind: FeatureKind::Sma {
                source: "close".into(),
                period: 3,
            },
        }];
        program.transitions[0].guard = "sma3 != 5".into();
        program
    }

    #[test]
    fn inequality_guard_waits_for_full_window() {
        let rig = Rig::new();
        let mut engine = rig.engine(inequality_program());

        for (minute, close) in [1.0, 2.0].into_iter().enumerate() {
            let outcome = engine.process_bar(&bar("SPY", minute as i64, close), false);
            assert!(outcome.transition.is_none());
        }
        assert_eq!(engine.state(), "WAITING");
        assert_eq!(rig.broker.submit_count(), 0);

        let outcome = engine.process_bar(&bar("SPY", 2, 3.0), false);
        assert!(outcome.transition.is_some());
        assert_eq!(engine.state(), "ARMED");
        assert_eq!(rig.broker.submit_count(), 1);
    }
}

mod risk {
    use super::*;

    #[test]
    fn kill_switch_rejects_without_broker_call() {
        let rig = Rig::new();
        let kill = KillSwitch::new(true);
        let mut engine = StrategyEngine::new(
            strategy(breakout(100.0, vec![buy(10.0)])),
            rig.ctx(RiskLimits::default(), kill.clone()),
        )
        .unwrap();

        let outcome = engine.process_bar(&bar("SPY", 0, 101.0), false);

        assert_eq!(engine.state(), "ARMED");
        match &outcome.actions[0] {
            ActionOutcome::Rejected { rejection, .. } => {
                assert_eq!(rejection.check, RiskCheck::KillSwitch)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(rig.broker.submit_count(), 0);
        assert_eq!(rig.audit.count(AuditKind::GuardRejected), 1);
    }

    #[test]
    fn max_quantity_rejects_oversized_plan() {
        let rig = Rig::new();
        let limits = RiskLimits {
            max_quantity: Some(5.0),
            ..RiskLimits::default()
        };
        let mut engine = StrategyEngine::new(
            strategy(breakout(100.0, vec![buy(10.0)])),
            rig.ctx(limits, KillSwitch::new(false)),
        )
        .unwrap();

        let outcome = engine.process_bar(&bar("SPY", 0, 101.0), false);
        assert!(matches!(outcome.actions[0], ActionOutcome::Rejected { .. }));
        assert_eq!(rig.broker.submit_count(), 0);
    }

    #[test]
    fn daily_loss_limit_rejects() {
        let rig = Rig::new();
        *rig.portfolio.pnl.lock().unwrap() = -600.0;
        let limits = RiskLimits {
            max_daily_loss: Some(500.0),
            ..RiskLimits::default()
        };
        let mut engine = StrategyEngine::new(
            strategy(breakout(100.0, vec![buy(1.0)])),
            rig.ctx(limits, KillSwitch::new(false)),
        )
        .unwrap();

        let outcome = engine.process_bar(&bar("SPY", 0, 101.0), false);
        match &outcome.actions[0] {
            ActionOutcome::Rejected { rejection, .. } => {
                assert_eq!(rejection.check, RiskCheck::DailyLoss)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}

mod snapshot {
    use super::*;

    #[test]
    fn restore_adopts_state_and_orders() {
        let rig = Rig::new();
        let mut original = rig.engine(breakout(100.0, vec![limit_buy(5.0, "close - 1")]));
        original.process_bar(&bar("SPY", 0, 101.0), false);
        let snapshot = original.snapshot();

        let mut restored = rig.engine(breakout(100.0, vec![limit_buy(5.0, "close - 1")]));
        restored.restore(&snapshot);

        assert_eq!(restored.state(), "ARMED");
        assert_eq!(restored.open_orders(), original.open_orders());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let rig = Rig::new();
        let mut engine = rig.engine(breakout(100.0, vec![]));
        engine.process_bar(&bar("SPY", 0, 101.0), false);
        let value = serde_json::to_value(engine.snapshot()).unwrap();
        assert_eq!(value["state"], "ARMED");
        assert_eq!(value["bar_count"], 1);
    }
}

/// S0 -> S1 -> S2 -> S3, each hop guarded by a threshold on close.
fn ladder() -> StrategyProgram {
    let states: Vec<String> = (0..4).map(|i| format!("S{i}")).collect();
    let transitions = (0..3)
        .map(|i| TransitionDef {
            name: format!("up{i}"),
            from: format!("S{i}"),
            to: format!("S{}", i + 1),
            guard: format!("close > {}", 10 * (i + 1)),
            actions: vec![],
        })
        .chain((1..4).map(|i| TransitionDef {
            name: format!("reset{i}"),
            from: format!("S{i}"),
            to: "S0".into(),
            guard: "close < 5".into(),
            actions: vec![],
        }))
        .collect();
    StrategyProgram {
        states,
        initial_state: "S0".into(),
        features: vec![],
        transitions,
        history_limit: 20,
    }
}

fn level(state: &str) -> i32 {
    state[1..].parse().unwrap()
}

proptest! {
    #[test]
    fn at_most_one_transition_per_bar(closes in prop::collection::vec(0.0f64..50.0, 1..60)) {
        let rig = Rig::new();
        let mut engine = rig.engine(ladder());
        for (minute, close) in closes.iter().enumerate() {
            let before = level(engine.state());
            let outcome = engine.process_bar(&bar("SPY", minute as i64, *close), false);
            let after = level(engine.state());
            match outcome.transition {
                None => prop_assert_eq!(before, after),
                Some(fired) => {
                    prop_assert_eq!(level(&fired.from), before);
                    prop_assert_eq!(level(&fired.to), after);
                    prop_assert!(after == before + 1 || after == 0);
                }
            }
        }
        prop_assert_eq!(engine.bar_count(), closes.len() as u64);
    }
}
