//! Broker adapter port.

use crate::domain::error::LifecycleError;
use crate::domain::order::{CancelReport, Order, OrderPlan, TradingEnv};

pub trait BrokerPort: Send + Sync {
    /// Submit a plan; returns every broker order it expanded to.
    fn submit_order_plan(&self, plan: &OrderPlan, env: TradingEnv)
    -> Result<Vec<Order>, LifecycleError>;

    /// Cancel the given orders, reporting the outcome per order.
    fn cancel_open_entries(
        &self,
        symbol: &str,
        orders: &[Order],
        env: TradingEnv,
    ) -> Result<CancelReport, LifecycleError>;

    fn get_open_orders(&self, symbol: &str, env: TradingEnv) -> Result<Vec<Order>, LifecycleError>;
}
