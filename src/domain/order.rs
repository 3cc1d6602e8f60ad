//! Broker-facing order types.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// Which broker account an instance trades against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingEnv {
    Paper,
    Live,
}

impl TradingEnv {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "paper" => Some(TradingEnv::Paper),
            "live" => Some(TradingEnv::Live),
            _ => None,
        }
    }
}

impl fmt::Display for TradingEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingEnv::Paper => write!(f, "paper"),
            TradingEnv::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Side that reduces a signed position to zero.
    pub fn to_flatten(net_quantity: f64) -> Side {
        if net_quantity > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryType {
    Market,
    Limit { price: f64 },
}

/// A bracket-style order request: one entry with optional protective exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlan {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry: EntryType,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderPlan {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        OrderPlan {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry: EntryType::Market,
            stop_loss: None,
            take_profit: None,
        }
    }

    /// Number of broker orders the plan expands to.
    pub fn order_count(&self) -> usize {
        1 + usize::from(self.stop_loss.is_some()) + usize::from(self.take_profit.is_some())
    }

    /// Price used for notional checks: the limit price, or `reference` for market entries.
    pub fn reference_price(&self, reference: f64) -> f64 {
        match self.entry {
            EntryType::Market => reference,
            EntryType::Limit { price } => price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    Working,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::Working)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub status: OrderStatus,
}

/// Per-order failure detail from a cancellation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelFailure {
    pub order_id: String,
    pub reason: String,
}

/// Failed cancels as `[{"order_id": .., "reason": ..}]` for audit metadata.
pub fn failures_value(failures: &[CancelFailure]) -> Value {
    Value::Array(
        failures
            .iter()
            .map(|f| json!({ "order_id": f.order_id, "reason": f.reason }))
            .collect(),
    )
}

/// `id: reason` pairs joined for error text.
pub fn describe_failures(failures: &[CancelFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.order_id, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<CancelFailure>,
}

impl CancelReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_side_follows_position_sign() {
        assert_eq!(Side::to_flatten(10.0), Side::Sell);
        assert_eq!(Side::to_flatten(-3.0), Side::Buy);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn order_count_includes_brackets() {
        let mut plan = OrderPlan::market("SPY", Side::Buy, 10.0);
        assert_eq!(plan.order_count(), 1);
        plan.stop_loss = Some(95.0);
        plan.take_profit = Some(110.0);
        assert_eq!(plan.order_count(), 3);
    }

    #[test]
    fn reference_price_prefers_limit() {
        let mut plan = OrderPlan::market("SPY", Side::Buy, 10.0);
        assert_eq!(plan.reference_price(101.0), 101.0);
        plan.entry = EntryType::Limit { price: 99.5 };
        assert_eq!(plan.reference_price(101.0), 99.5);
    }

    #[test]
    fn cancel_report_completeness() {
        let mut report = CancelReport {
            succeeded: vec!["1".into()],
            failed: vec![],
        };
        assert!(report.is_complete());
        report.failed.push(CancelFailure {
            order_id: "2".into(),
            reason: "already filled".into(),
        });
        assert!(!report.is_complete());
    }

    #[test]
    fn trading_env_parse() {
        assert_eq!(TradingEnv::parse("Paper"), Some(TradingEnv::Paper));
        assert_eq!(TradingEnv::parse(" live "), Some(TradingEnv::Live));
        assert_eq!(TradingEnv::parse("demo"), None);
    }

    #[test]
    fn open_statuses() {
        assert!(OrderStatus::Working.is_open());
        assert!(!OrderStatus::Filled.is_open());
    }
}
