//! Strategy programs: the state set, features and guarded transitions that
//! drive one engine instance.
//!
//! Programs are stored and exchanged as JSON (`StrategyProgram`) and compiled
//! into a `CompiledProgram` with parsed guards before an engine runs them.
//! `load_program` reads the INI authoring format:
//!
//! ```ini
//! [strategy]
//! name = Breakout
//! symbol = SPY
//! timeframe = 1m
//! states = WAITING, ARMED
//! initial = WAITING
//! features = sma_fast
//! transitions = arm
//!
//! [feature.sma_fast]
//! kind = sma
//! source = close
//! period = 5
//!
//! [transition.arm]
//! from = WAITING
//! to = ARMED
//! guard = close > 100
//! actions = submit_order_plan
//! side = buy
//! quantity = 10
//! ```

use crate::domain::bar::BUILTIN_FIELDS;
use crate::domain::error::LifecycleError;
use crate::domain::expr::Expr;
use crate::domain::expr_parser;
use crate::domain::feature::{CompiledFeature, FeatureDef, FeatureKind, TIMER_PREFIX};
use crate::domain::order::Side;
use crate::domain::strategy::NewStrategy;
use crate::ports::config_port::ConfigPort;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_HISTORY_LIMIT: usize = 500;
/// Process-wide ceiling on `history_limit` unless `[engine] history_limit` says otherwise.
pub const DEFAULT_MAX_HISTORY_LIMIT: usize = 5000;

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDef {
    SubmitOrderPlan {
        side: Side,
        quantity: f64,
        #[serde(default)]
        limit_price: Option<String>,
        #[serde(default)]
        stop_loss: Option<String>,
        #[serde(default)]
        take_profit: Option<String>,
    },
    CancelOpenOrders,
    StartTimer {
        name: String,
        bars: u32,
    },
    CancelTimer {
        name: String,
    },
    Log {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub name: String,
    pub from: String,
    pub to: String,
    pub guard: String,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProgram {
    pub states: Vec<String>,
    pub initial_state: String,
    #[serde(default)]
    pub features: Vec<FeatureDef>,
    pub transitions: Vec<TransitionDef>,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Order plan with price fields still to be evaluated against the live frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanTemplate {
    pub side: Side,
    pub quantity: f64,
    pub limit_price: Option<Expr>,
    pub stop_loss: Option<Expr>,
    pub take_profit: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledAction {
    SubmitOrderPlan(PlanTemplate),
    CancelOpenOrders,
    StartTimer { name: String, bars: u32 },
    CancelTimer { name: String },
    Log { message: String },
}

impl CompiledAction {
    pub fn label(&self) -> &'static str {
        match self {
            CompiledAction::SubmitOrderPlan(_) => "submit_order_plan",
            CompiledAction::CancelOpenOrders => "cancel_open_orders",
            CompiledAction::StartTimer { .. } => "start_timer",
            CompiledAction::CancelTimer { .. } => "cancel_timer",
            CompiledAction::Log { .. } => "log",
        }
    }

    /// Whether executing the action reaches the broker.
    pub fn has_broker_effect(&self) -> bool {
        matches!(
            self,
            CompiledAction::SubmitOrderPlan(_) | CompiledAction::CancelOpenOrders
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTransition {
    pub name: String,
    pub from: String,
    pub to: String,
    pub guard: Expr,
    pub actions: Vec<CompiledAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProgram {
    pub source: StrategyProgram,
    pub features: Vec<CompiledFeature>,
    pub transitions: Vec<CompiledTransition>,
}

impl CompiledProgram {
    pub fn initial_state(&self) -> &str {
        &self.source.initial_state
    }

    pub fn history_limit(&self) -> usize {
        self.source.history_limit
    }

    /// Transitions leaving `state`, in declaration order.
    pub fn transitions_from<'a>(
        &'a self,
        state: &'a str,
    ) -> impl Iterator<Item = &'a CompiledTransition> + 'a {
        self.transitions.iter().filter(move |t| t.from == state)
    }
}

fn invalid(reason: impl Into<String>) -> LifecycleError {
    LifecycleError::ProgramInvalid {
        reason: reason.into(),
    }
}

fn parse_expr(context: &str, input: &str) -> Result<Expr, LifecycleError> {
    expr_parser::parse(input).map_err(|e| {
        invalid(format!(
            "{context}:\n{}",
            e.display_with_context(input)
        ))
    })
}

/// Reject programs whose bar history would exceed the process cap.
pub fn check_history_limit(program: &StrategyProgram, max_history: usize) -> Result<(), LifecycleError> {
    if program.history_limit > max_history {
        return Err(invalid(format!(
            "history_limit {} exceeds the configured maximum of {max_history}",
            program.history_limit
        )));
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Validate a program and parse every expression it contains.
pub fn compile(program: &StrategyProgram) -> Result<CompiledProgram, LifecycleError> {
    if program.states.is_empty() {
        return Err(invalid("program declares no states"));
    }
    let mut states = HashSet::new();
    for state in &program.states {
        if state.trim().is_empty() {
            return Err(invalid("state names must be non-empty"));
        }
        if !states.insert(state.as_str()) {
            return Err(invalid(format!("duplicate state '{state}'")));
        }
    }
    if !states.contains(program.initial_state.as_str()) {
        return Err(invalid(format!(
            "initial state '{}' is not a declared state",
            program.initial_state
        )));
    }
    if program.history_limit == 0 {
        return Err(invalid("history_limit must be at least 1"));
    }

    let mut known: HashSet<String> = BUILTIN_FIELDS.iter().map(|s| s.to_string()).collect();
    let mut features = Vec::with_capacity(program.features.len());
    for def in &program.features {
        if !is_identifier(&def.name) || def.name.starts_with(TIMER_PREFIX) {
            return Err(invalid(format!("invalid feature name '{}'", def.name)));
        }
        if known.contains(&def.name) {
            return Err(invalid(format!("feature '{}' declared twice", def.name)));
        }
        let compiled = match &def.kind {
            FeatureKind::Expr { expr } => {
                let parsed = parse_expr(&format!("feature '{}'", def.name), expr)?;
                check_references(&parsed, &known, &HashSet::new(), &def.name)?;
                CompiledFeature::Expr {
                    name: def.name.clone(),
                    expr: parsed,
                }
            }
            kind => {
                if let Some((source, period)) = kind.rolling_source() {
                    if period == 0 {
                        return Err(invalid(format!(
                            "feature '{}' needs a period of at least 1",
                            def.name
                        )));
                    }
                    if !known.contains(source) {
                        return Err(invalid(format!(
                            "feature '{}' reads '{}' which is not declared before it",
                            def.name, source
                        )));
                    }
                }
                CompiledFeature::Rolling {
                    name: def.name.clone(),
                    kind: kind.clone(),
                }
            }
        };
        known.insert(def.name.clone());
        features.push(compiled);
    }

    let timers: HashSet<String> = program
        .transitions
        .iter()
        .flat_map(|t| t.actions.iter())
        .filter_map(|a| match a {
            ActionDef::StartTimer { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();

    let mut names = HashSet::new();
    let mut transitions = Vec::with_capacity(program.transitions.len());
    for def in &program.transitions {
        if !names.insert(def.name.as_str()) {
            return Err(invalid(format!("duplicate transition '{}'", def.name)));
        }
        for endpoint in [&def.from, &def.to] {
            if !states.contains(endpoint.as_str()) {
                return Err(invalid(format!(
                    "transition '{}' references unknown state '{}'",
                    def.name, endpoint
                )));
            }
        }
        let guard = parse_expr(&format!("guard of transition '{}'", def.name), &def.guard)?;
        check_references(&guard, &known, &timers, &def.name)?;
        if guard.max_lookback() >= program.history_limit {
            return Err(invalid(format!(
                "guard of transition '{}' looks back {} bars but history_limit is {}",
                def.name,
                guard.max_lookback(),
                program.history_limit
            )));
        }
        let actions = def
            .actions
            .iter()
            .map(|a| compile_action(a, &def.name, &known, &timers))
            .collect::<Result<Vec<_>, _>>()?;
        transitions.push(CompiledTransition {
            name: def.name.clone(),
            from: def.from.clone(),
            to: def.to.clone(),
            guard,
            actions,
        });
    }

    Ok(CompiledProgram {
        source: program.clone(),
        features,
        transitions,
    })
}

fn check_references(
    expr: &Expr,
    known: &HashSet<String>,
    timers: &HashSet<String>,
    owner: &str,
) -> Result<(), LifecycleError> {
    for name in expr.referenced_features() {
        let is_timer = name
            .strip_prefix(TIMER_PREFIX)
            .is_some_and(|t| timers.contains(t));
        if !known.contains(&name) && !is_timer {
            return Err(invalid(format!(
                "'{owner}' references unknown feature '{name}'"
            )));
        }
    }
    Ok(())
}

fn compile_action(
    def: &ActionDef,
    transition: &str,
    known: &HashSet<String>,
    timers: &HashSet<String>,
) -> Result<CompiledAction, LifecycleError> {
    let optional = |field: &str, input: &Option<String>| -> Result<Option<Expr>, LifecycleError> {
        match input.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(text) => {
                let expr = parse_expr(&format!("{field} of transition '{transition}'"), text)?;
                check_references(&expr, known, timers, transition)?;
                Ok(Some(expr))
            }
            None => Ok(None),
        }
    };
    Ok(match def {
        ActionDef::SubmitOrderPlan {
            side,
            quantity,
            limit_price,
            stop_loss,
            take_profit,
        } => {
            if !(*quantity > 0.0) {
                return Err(invalid(format!(
                    "transition '{transition}' submits a non-positive quantity"
                )));
            }
            CompiledAction::SubmitOrderPlan(PlanTemplate {
                side: *side,
                quantity: *quantity,
                limit_price: optional("limit_price", limit_price)?,
                stop_loss: optional("stop_loss", stop_loss)?,
                take_profit: optional("take_profit", take_profit)?,
            })
        }
        ActionDef::CancelOpenOrders => CompiledAction::CancelOpenOrders,
        ActionDef::StartTimer { name, bars } => {
            if !is_identifier(name) {
                return Err(invalid(format!("invalid timer name '{name}'")));
            }
            CompiledAction::StartTimer {
                name: name.clone(),
                bars: *bars,
            }
        }
        ActionDef::CancelTimer { name } => CompiledAction::CancelTimer { name: name.clone() },
        ActionDef::Log { message } => CompiledAction::Log {
            message: message.clone(),
        },
    })
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn require(config: &dyn ConfigPort, section: &str, key: &str) -> Result<String, LifecycleError> {
    config
        .get_string(section, key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| LifecycleError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        })
}

fn require_period(config: &dyn ConfigPort, section: &str) -> Result<usize, LifecycleError> {
    let period = config.get_int(section, "period", 0);
    if period < 1 {
        return Err(LifecycleError::ConfigInvalid {
            section: section.to_string(),
            key: "period".to_string(),
            reason: "period must be a positive integer".to_string(),
        });
    }
    Ok(period as usize)
}

fn load_feature(config: &dyn ConfigPort, name: &str) -> Result<FeatureDef, LifecycleError> {
    let section = format!("feature.{}", name.to_lowercase());
    let kind_name = require(config, &section, "kind")?;
    let source = || {
        config
            .get_string(&section, "source")
            .unwrap_or_else(|| "close".to_string())
    };
    let kind = match kind_name.trim().to_lowercase().as_str() {
        "sma" => FeatureKind::Sma {
            source: source(),
            period: require_period(config, &section)?,
        },
        "ema" => FeatureKind::Ema {
            source: source(),
            period: require_period(config, &section)?,
        },
        "stddev" => FeatureKind::Stddev {
            source: source(),
            period: require_period(config, &section)?,
        },
        "rsi" => FeatureKind::Rsi {
            source: source(),
            period: require_period(config, &section)?,
        },
        "highest" => FeatureKind::Highest {
            source: source(),
            period: require_period(config, &section)?,
        },
        "lowest" => FeatureKind::Lowest {
            source: source(),
            period: require_period(config, &section)?,
        },
        "change" => FeatureKind::Change {
            source: source(),
            period: require_period(config, &section)?,
        },
        "expr" => FeatureKind::Expr {
            expr: require(config, &section, "expr")?,
        },
        other => {
            return Err(LifecycleError::ConfigInvalid {
                section,
                key: "kind".to_string(),
                reason: format!("unknown feature kind '{other}'"),
            });
        }
    };
    Ok(FeatureDef {
        name: name.to_string(),
        kind,
    })
}

fn load_action(
    config: &dyn ConfigPort,
    section: &str,
    action: &str,
) -> Result<ActionDef, LifecycleError> {
    match action.to_lowercase().as_str() {
        "submit_order_plan" => {
            let side = match require(config, section, "side")?.trim().to_lowercase().as_str() {
                "buy" => Side::Buy,
                "sell" => Side::Sell,
                other => {
                    return Err(LifecycleError::ConfigInvalid {
                        section: section.to_string(),
                        key: "side".to_string(),
                        reason: format!("expected buy or sell, found '{other}'"),
                    });
                }
            };
            Ok(ActionDef::SubmitOrderPlan {
                side,
                quantity: config.get_double(section, "quantity", 0.0),
                limit_price: config.get_string(section, "limit_price"),
                stop_loss: config.get_string(section, "stop_loss"),
                take_profit: config.get_string(section, "take_profit"),
            })
        }
        "cancel_open_orders" => Ok(ActionDef::CancelOpenOrders),
        "start_timer" => Ok(ActionDef::StartTimer {
            name: require(config, section, "timer")?,
            bars: config.get_int(section, "timer_bars", 0).max(0) as u32,
        }),
        "cancel_timer" => Ok(ActionDef::CancelTimer {
            name: require(config, section, "timer")?,
        }),
        "log" => Ok(ActionDef::Log {
            message: config.get_string(section, "message").unwrap_or_default(),
        }),
        other => Err(LifecycleError::ConfigInvalid {
            section: section.to_string(),
            key: "actions".to_string(),
            reason: format!("unknown action '{other}'"),
        }),
    }
}

/// Read a strategy definition from the INI authoring format and compile-check it.
pub fn load_program(config: &dyn ConfigPort, owner: &str) -> Result<NewStrategy, LifecycleError> {
    let name = require(config, "strategy", "name")?;
    let symbol = require(config, "strategy", "symbol")?;
    let timeframe = config
        .get_string("strategy", "timeframe")
        .unwrap_or_else(|| "1m".to_string());
    let states = split_list(config.get_string("strategy", "states"));
    let initial_state = config
        .get_string("strategy", "initial")
        .map(|s| s.trim().to_string())
        .or_else(|| states.first().cloned())
        .ok_or_else(|| LifecycleError::ConfigMissing {
            section: "strategy".to_string(),
            key: "states".to_string(),
        })?;
    let history_limit = config.get_int("strategy", "history_limit", DEFAULT_HISTORY_LIMIT as i64);
    if history_limit < 1 {
        return Err(LifecycleError::ConfigInvalid {
            section: "strategy".to_string(),
            key: "history_limit".to_string(),
            reason: "history_limit must be at least 1".to_string(),
        });
    }

    let features = split_list(config.get_string("strategy", "features"))
        .iter()
        .map(|f| load_feature(config, f))
        .collect::<Result<Vec<_>, _>>()?;

    let mut transitions = Vec::new();
    for name in split_list(config.get_string("strategy", "transitions")) {
        let section = format!("transition.{}", name.to_lowercase());
        let actions = split_list(config.get_string(&section, "actions"))
            .iter()
            .map(|a| load_action(config, &section, a))
            .collect::<Result<Vec<_>, _>>()?;
        transitions.push(TransitionDef {
            from: require(config, &section, "from")?.trim().to_string(),
            to: require(config, &section, "to")?.trim().to_string(),
            guard: require(config, &section, "guard")?,
            actions,
            name,
        });
    }

    let program = StrategyProgram {
        states,
        initial_state,
        features,
        transitions,
        history_limit: history_limit as usize,
    };
    compile(&program)?;

    Ok(NewStrategy {
        name,
        owner: owner.to_string(),
        symbol: symbol.trim().to_uppercase(),
        timeframe: timeframe.trim().to_string(),
        program,
    })
}
