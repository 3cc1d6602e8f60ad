//! Position and account P&L source.

use crate::domain::error::LifecycleError;

pub trait PositionSource: Send + Sync {
    /// Signed net quantity held in `symbol`. `fresh` bypasses any cache.
    fn net_quantity(&self, symbol: &str, fresh: bool) -> Result<f64, LifecycleError>;

    /// Realised plus unrealised P&L for the current trading day.
    fn daily_pnl(&self) -> Result<f64, LifecycleError>;
}
