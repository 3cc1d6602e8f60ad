//! Per-bar feature computation.
//!
//! A `FeatureFrame` holds a bounded history for every feature, newest last.
//! Each bar pushes exactly one value per feature: builtin OHLCV passthroughs
//! first, then derived features in declared order, so a derived feature can
//! read the current value of anything declared before it.
//!
//! Rolling indicators follow the usual definitions:
//! - SMA: arithmetic mean of the last n source values
//! - EMA: k = 2/(n+1), seeded with the first full-window SMA
//! - STDDEV: population standard deviation over n values
//! - RSI: Wilder smoothing of gains/losses; avg_loss == 0 gives 100
//! - HIGHEST/LOWEST: max/min over n values
//! - CHANGE: source[0] - source[n]
//!
//! Warm-up values are NaN so every comparison against them is false.

use crate::domain::bar::{Bar, BUILTIN_FIELDS};
use crate::domain::error::EvalError;
use crate::domain::expr::Expr;
use crate::domain::expr_eval::{evaluate_number, FeatureSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

pub const TIMER_PREFIX: &str = "timer_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    Sma { source: String, period: usize },
    Ema { source: String, period: usize },
    Stddev { source: String, period: usize },
    Rsi { source: String, period: usize },
    Highest { source: String, period: usize },
    Lowest { source: String, period: usize },
    Change { source: String, period: usize },
    Expr { expr: String },
}

impl FeatureKind {
    /// Source feature and window for rolling kinds.
    pub fn rolling_source(&self) -> Option<(&str, usize)> {
        match self {
            FeatureKind::Sma { source, period }
            | FeatureKind::Ema { source, period }
            | FeatureKind::Stddev { source, period }
            | FeatureKind::Rsi { source, period }
            | FeatureKind::Highest { source, period }
            | FeatureKind::Lowest { source, period }
            | FeatureKind::Change { source, period } => Some((source.as_str(), *period)),
            FeatureKind::Expr { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FeatureKind,
}

/// A validated feature ready to compute.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledFeature {
    Rolling { name: String, kind: FeatureKind },
    Expr { name: String, expr: Expr },
}

impl CompiledFeature {
    pub fn name(&self) -> &str {
        match self {
            CompiledFeature::Rolling { name, .. } | CompiledFeature::Expr { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct WilderState {
    changes: usize,
    gain_sum: f64,
    loss_sum: f64,
    avg_gain: f64,
    avg_loss: f64,
}

#[derive(Debug, Clone)]
pub struct FeatureFrame {
    history: HashMap<String, VecDeque<f64>>,
    timers: BTreeMap<String, u32>,
    wilder: HashMap<String, WilderState>,
    limit: usize,
}

impl FeatureFrame {
    pub fn new(limit: usize) -> Self {
        FeatureFrame {
            history: HashMap::new(),
            timers: BTreeMap::new(),
            wilder: HashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Push builtins and derived features for one bar. Derived features that
    /// fail to evaluate record NaN and report the error.
    pub fn compute(
        &mut self,
        bar: &Bar,
        features: &[CompiledFeature],
    ) -> Vec<(String, EvalError)> {
        for name in BUILTIN_FIELDS {
            if let Some(value) = bar.field(name) {
                self.push(name, value);
            }
        }

        let mut errors = Vec::new();
        for feature in features {
            let value = match feature {
                CompiledFeature::Rolling { name, kind } => self.rolling(name, kind),
                CompiledFeature::Expr { expr, .. } => match evaluate_number(expr, self) {
                    Ok(v) => v,
                    Err(e) => {
                        errors.push((feature.name().to_string(), e));
                        f64::NAN
                    }
                },
            };
            self.push(feature.name(), value);
        }
        errors
    }

    fn push(&mut self, name: &str, value: f64) {
        let series = self.history.entry(name.to_string()).or_default();
        series.push_back(value);
        while series.len() > self.limit {
            series.pop_front();
        }
    }

    fn window(&self, source: &str, period: usize) -> Option<Vec<f64>> {
        let series = self.history.get(source)?;
        if period == 0 || series.len() < period {
            return None;
        }
        Some(series.iter().skip(series.len() - period).copied().collect())
    }

    fn previous_own(&self, name: &str) -> Option<f64> {
        self.history.get(name).and_then(|s| s.back().copied())
    }

    fn rolling(&mut self, name: &str, kind: &FeatureKind) -> f64 {
        match kind {
            FeatureKind::Sma { source, period } => self
                .window(source, *period)
                .map(|w| mean(&w))
                .unwrap_or(f64::NAN),
            FeatureKind::Ema { source, period } => {
                let k = 2.0 / (*period as f64 + 1.0);
                match self.previous_own(name).filter(|v| !v.is_nan()) {
                    Some(prev) => match self.current(source) {
                        Some(price) => price * k + prev * (1.0 - k),
                        None => f64::NAN,
                    },
                    None => self
                        .window(source, *period)
                        .map(|w| mean(&w))
                        .unwrap_or(f64::NAN),
                }
            }
            FeatureKind::Stddev { source, period } => self
                .window(source, *period)
                .map(|w| {
                    let m = mean(&w);
                    let variance =
                        w.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / w.len() as f64;
                    variance.sqrt()
                })
                .unwrap_or(f64::NAN),
            FeatureKind::Rsi { source, period } => self.rsi(name, source, *period),
            FeatureKind::Highest { source, period } => self
                .window(source, *period)
                .map(|w| w.into_iter().fold(f64::NEG_INFINITY, f64::max))
                .unwrap_or(f64::NAN),
            FeatureKind::Lowest { source, period } => self
                .window(source, *period)
                .map(|w| w.into_iter().fold(f64::INFINITY, f64::min))
                .unwrap_or(f64::NAN),
            FeatureKind::Change { source, period } => self
                .window(source, *period + 1)
                .map(|w| w[w.len() - 1] - w[0])
                .unwrap_or(f64::NAN),
            FeatureKind::Expr { .. } => f64::NAN,
        }
    }

    fn rsi(&mut self, name: &str, source: &str, period: usize) -> f64 {
        let Some(w) = self.window(source, 2) else {
            return f64::NAN;
        };
        if period == 0 {
            return f64::NAN;
        }
        let change = w[1] - w[0];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        let state = self.wilder.entry(name.to_string()).or_insert(WilderState {
            changes: 0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        });
        state.changes += 1;
        let n = period as f64;
        if state.changes < period {
            state.gain_sum += gain;
            state.loss_sum += loss;
            return f64::NAN;
        }
        if state.changes == period {
            state.avg_gain = (state.gain_sum + gain) / n;
            state.avg_loss = (state.loss_sum + loss) / n;
        } else {
            state.avg_gain = (state.avg_gain * (n - 1.0) + gain) / n;
            state.avg_loss = (state.avg_loss * (n - 1.0) + loss) / n;
        }
        if state.avg_loss == 0.0 {
            100.0
        } else {
            100.0 - (100.0 / (1.0 + state.avg_gain / state.avg_loss))
        }
    }

    pub fn current(&self, name: &str) -> Option<f64> {
        self.previous_own(name)
    }

    /// Current value of every feature, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.history
            .iter()
            .filter_map(|(name, series)| series.back().map(|v| (name.clone(), *v)))
            .collect()
    }

    /// Number of bars of history retained for `name`.
    pub fn depth(&self, name: &str) -> usize {
        self.history.get(name).map_or(0, VecDeque::len)
    }

    pub fn start_timer(&mut self, name: &str, bars: u32) {
        self.timers.insert(name.to_string(), bars);
    }

    pub fn cancel_timer(&mut self, name: &str) -> bool {
        self.timers.remove(name).is_some()
    }

    /// Count every active timer down by one bar; expired timers stay at zero.
    pub fn tick_timers(&mut self) {
        for remaining in self.timers.values_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    pub fn timers(&self) -> &BTreeMap<String, u32> {
        &self.timers
    }
}

impl FeatureSource for FeatureFrame {
    fn lookup(&self, name: &str, offset: usize) -> Result<f64, EvalError> {
        if let Some(series) = self.history.get(name) {
            if offset >= series.len() {
                return Err(EvalError::LookbackOutOfRange {
                    name: name.to_string(),
                    offset,
                    available: series.len(),
                });
            }
            return Ok(series[series.len() - 1 - offset]);
        }
        if let Some(timer) = name.strip_prefix(TIMER_PREFIX) {
            if let Some(remaining) = self.timers.get(timer) {
                if offset > 0 {
                    return Err(EvalError::LookbackOutOfRange {
                        name: name.to_string(),
                        offset,
                        available: 1,
                    });
                }
                return Ok(f64::from(*remaining));
            }
        }
        Err(EvalError::UnknownFeature {
            name: name.to_string(),
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expr_parser::parse;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, close: f64) -> Bar {
        Bar {
            symbol: "TEST".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
        }
    }

    fn rolling(name: &str, kind: FeatureKind) -> CompiledFeature {
        CompiledFeature::Rolling {
            name: name.into(),
            kind,
        }
    }

    fn run(prices: &[f64], features: &[CompiledFeature], limit: usize) -> FeatureFrame {
        let mut frame = FeatureFrame::new(limit);
        for (i, p) in prices.iter().enumerate() {
            frame.compute(&bar(i as i64, *p), features);
        }
        frame
    }

    #[test]
    fn sma_warmup_then_mean() {
        let features = [rolling(
            "sma3",
            FeatureKind::Sma {
                source: "close".into(),
                period: 3,
            },
        )];
        let mut frame = FeatureFrame::new(10);
        frame.compute(&bar(0, 10.0), &features);
        frame.compute(&bar(1, 20.0), &features);
        assert!(frame.current("sma3").unwrap().is_nan());
        frame.compute(&bar(2, 30.0), &features);
        assert_relative_eq!(frame.current("sma3").unwrap(), 20.0);
        frame.compute(&bar(3, 40.0), &features);
        assert_relative_eq!(frame.current("sma3").unwrap(), 30.0);
    }

    #[test]
    fn ema_seeds_with_sma() {
        let features = [rolling(
            "ema3",
            FeatureKind::Ema {
                source: "close".into(),
                period: 3,
            },
        )];
        let frame = run(&[10.0, 20.0, 30.0, 40.0], &features, 10);
        // seed = 20, k = 0.5 → 40*0.5 + 20*0.5 = 30
        assert_relative_eq!(frame.current("ema3").unwrap(), 30.0);
    }

    #[test]
    fn stddev_population() {
        let features = [rolling(
            "sd",
            FeatureKind::Stddev {
                source: "close".into(),
                period: 4,
            },
        )];
        let frame = run(&[2.0, 4.0, 4.0, 6.0], &features, 10);
        assert_relative_eq!(frame.current("sd").unwrap(), 2.0_f64.sqrt());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let features = [rolling(
            "rsi",
            FeatureKind::Rsi {
                source: "close".into(),
                period: 3,
            },
        )];
        let mut frame = FeatureFrame::new(10);
        for (i, p) in [1.0, 2.0, 3.0].iter().enumerate() {
            frame.compute(&bar(i as i64, *p), &features);
            assert!(frame.current("rsi").unwrap().is_nan());
        }
        frame.compute(&bar(3, 4.0), &features);
        assert_relative_eq!(frame.current("rsi").unwrap(), 100.0);
    }

    #[test]
    fn rsi_mixed_moves() {
        let features = [rolling(
            "rsi",
            FeatureKind::Rsi {
                source: "close".into(),
                period: 2,
            },
        )];
        // changes: +2, -1 → avg_gain 1, avg_loss 0.5 → RSI = 100 - 100/3
        let frame = run(&[10.0, 12.0, 11.0], &features, 10);
        assert_relative_eq!(frame.current("rsi").unwrap(), 100.0 - 100.0 / 3.0);
    }

    #[test]
    fn highest_lowest_change() {
        let features = [
            rolling(
                "hi",
                FeatureKind::Highest {
                    source: "close".into(),
                    period: 3,
                },
            ),
            rolling(
                "lo",
                FeatureKind::Lowest {
                    source: "close".into(),
                    period: 3,
                },
            ),
            rolling(
                "chg",
                FeatureKind::Change {
                    source: "close".into(),
                    period: 2,
                },
            ),
        ];
        let frame = run(&[5.0, 9.0, 7.0, 6.0], &features, 10);
        assert_relative_eq!(frame.current("hi").unwrap(), 9.0);
        assert_relative_eq!(frame.current("lo").unwrap(), 6.0);
        assert_relative_eq!(frame.current("chg").unwrap(), -3.0);
    }

    #[test]
    fn expr_feature_reads_earlier_feature_same_bar() {
        let features = [
            rolling(
                "sma2",
                FeatureKind::Sma {
                    source: "close".into(),
                    period: 2,
                },
            ),
            CompiledFeature::Expr {
                name: "spread".into(),
                expr: parse("close - sma2").unwrap(),
            },
        ];
        let frame = run(&[10.0, 20.0], &features, 10);
        assert_relative_eq!(frame.current("spread").unwrap(), 5.0);
    }

    #[test]
    fn expr_feature_error_records_nan() {
        let features = [CompiledFeature::Expr {
            name: "mom".into(),
            expr: parse("close - close[2]").unwrap(),
        }];
        let mut frame = FeatureFrame::new(10);
        let errors = frame.compute(&bar(0, 10.0), &features);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].1, EvalError::LookbackOutOfRange { .. }));
        assert!(frame.current("mom").unwrap().is_nan());
    }

    #[test]
    fn history_is_bounded() {
        let frame = run(&[1.0, 2.0, 3.0, 4.0, 5.0], &[], 3);
        assert_eq!(frame.depth("close"), 3);
        assert_eq!(frame.lookup("close", 2).unwrap(), 3.0);
        assert!(matches!(
            frame.lookup("close", 3),
            Err(EvalError::LookbackOutOfRange { available: 3, .. })
        ));
    }

    #[test]
    fn timers_count_down_and_stick_at_zero() {
        let mut frame = FeatureFrame::new(5);
        frame.start_timer("cooldown", 2);
        assert_eq!(frame.lookup("timer_cooldown", 0).unwrap(), 2.0);
        frame.tick_timers();
        frame.tick_timers();
        frame.tick_timers();
        assert_eq!(frame.lookup("timer_cooldown", 0).unwrap(), 0.0);
        assert!(frame.cancel_timer("cooldown"));
        assert!(matches!(
            frame.lookup("timer_cooldown", 0),
            Err(EvalError::UnknownFeature { .. })
        ));
    }
}
