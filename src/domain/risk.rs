//! Pre-submission risk guards for order plans.
//!
//! Checks run in a fixed order and stop at the first violation. A violation is
//! a value, not an error: the caller skips the action and records why.

use crate::domain::order::OrderPlan;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheck {
    KillSwitch,
    DailyLoss,
    MaxOpenOrders,
    MaxQuantity,
    MaxNotional,
}

impl fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskCheck::KillSwitch => "kill_switch",
            RiskCheck::DailyLoss => "daily_loss",
            RiskCheck::MaxOpenOrders => "max_open_orders",
            RiskCheck::MaxQuantity => "max_quantity",
            RiskCheck::MaxNotional => "max_notional",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardRejection {
    pub check: RiskCheck,
    pub message: String,
    pub requested: f64,
    pub limit: f64,
}

/// Configured limits. `None` disables a check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskLimits {
    pub max_daily_loss: Option<f64>,
    pub max_open_orders_per_symbol: Option<usize>,
    pub max_quantity: Option<f64>,
    pub max_notional: Option<f64>,
}

/// Process-wide trading halt shared by every engine instance.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new(engaged: bool) -> Self {
        KillSwitch(Arc::new(AtomicBool::new(engaged)))
    }

    pub fn engage(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Account state the checks read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskContext {
    pub daily_pnl: f64,
    /// Open orders on the symbol that will still be open after this
    /// instance cancels its own.
    pub other_open_orders: usize,
    pub reference_price: f64,
}

pub fn check_order_plan(
    limits: &RiskLimits,
    kill_switch: &KillSwitch,
    plan: &OrderPlan,
    ctx: &RiskContext,
) -> Result<(), GuardRejection> {
    if kill_switch.is_engaged() {
        return Err(GuardRejection {
            check: RiskCheck::KillSwitch,
            message: "kill switch engaged".to_string(),
            requested: plan.quantity,
            limit: 0.0,
        });
    }

    if let Some(max_loss) = limits.max_daily_loss {
        if ctx.daily_pnl <= -max_loss {
            return Err(GuardRejection {
                check: RiskCheck::DailyLoss,
                message: format!(
                    "daily P&L {:.2} breaches loss limit {:.2}",
                    ctx.daily_pnl, max_loss
                ),
                requested: -ctx.daily_pnl,
                limit: max_loss,
            });
        }
    }

    if let Some(max_open) = limits.max_open_orders_per_symbol {
        let after = ctx.other_open_orders + plan.order_count();
        if after > max_open {
            return Err(GuardRejection {
                check: RiskCheck::MaxOpenOrders,
                message: format!(
                    "{} open order(s) on {} after submission exceeds {}",
                    after, plan.symbol, max_open
                ),
                requested: after as f64,
                limit: max_open as f64,
            });
        }
    }

    if let Some(max_qty) = limits.max_quantity {
        if plan.quantity > max_qty {
            return Err(GuardRejection {
                check: RiskCheck::MaxQuantity,
                message: format!("quantity {} exceeds {}", plan.quantity, max_qty),
                requested: plan.quantity,
                limit: max_qty,
            });
        }
    }

    if let Some(max_notional) = limits.max_notional {
        let notional = plan.quantity * plan.reference_price(ctx.reference_price);
        if !(notional <= max_notional) {
            return Err(GuardRejection {
                check: RiskCheck::MaxNotional,
                message: format!("notional {notional:.2} exceeds {max_notional:.2}"),
                requested: notional,
                limit: max_notional,
            });
        }
    }

    Ok(())
}
