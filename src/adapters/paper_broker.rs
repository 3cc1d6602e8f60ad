//! In-memory paper broker and position book.
//!
//! Market entries fill immediately at the last marked price adjusted for
//! slippage. Limit entries and protective exits rest as working orders and
//! fill when a marked bar trades through their price. Exits only arm once
//! their entry has filled, and the first exit to fill cancels its sibling.

use crate::domain::bar::Bar;
use crate::domain::error::LifecycleError;
use crate::domain::order::{
    CancelFailure, CancelReport, EntryType, Order, OrderPlan, OrderStatus, Side, TradingEnv,
};
use crate::ports::broker_port::BrokerPort;
use crate::ports::data_port::BarSource;
use crate::ports::portfolio_port::PositionSource;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PaperSettings {
    pub slippage_pct: f64,
    pub commission_per_trade: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Entry { limit: Option<f64> },
    StopLoss { price: f64 },
    TakeProfit { price: f64 },
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order: Order,
    role: Role,
    parent: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Holding {
    quantity: f64,
    avg_price: f64,
}

#[derive(Default)]
struct Book {
    next_id: u64,
    prices: HashMap<String, f64>,
    holdings: HashMap<String, Holding>,
    realized: f64,
    orders: Vec<PaperOrder>,
}

/// Buy fills above the market, sell fills below it.
fn slipped(price: f64, side: Side, slippage_pct: f64) -> f64 {
    match side {
        Side::Buy => price * (1.0 + slippage_pct / 100.0),
        Side::Sell => price * (1.0 - slippage_pct / 100.0),
    }
}

fn signed(side: Side, quantity: f64) -> f64 {
    match side {
        Side::Buy => quantity,
        Side::Sell => -quantity,
    }
}

impl Book {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    fn apply_fill(&mut self, symbol: &str, side: Side, quantity: f64, price: f64, commission: f64) {
        let holding = self.holdings.entry(symbol.to_string()).or_default();
        let delta = signed(side, quantity);
        let mut realized = -commission;
        if holding.quantity * delta < 0.0 {
            let closing = delta.abs().min(holding.quantity.abs());
            realized += (price - holding.avg_price) * closing * holding.quantity.signum();
            let remaining = holding.quantity + delta;
            if remaining.abs() < EPSILON {
                *holding = Holding::default();
            } else if remaining.signum() == holding.quantity.signum() {
                holding.quantity = remaining;
            } else {
                holding.quantity = remaining;
                holding.avg_price = price;
            }
        } else {
            let total = holding.quantity + delta;
            holding.avg_price =
                (holding.avg_price * holding.quantity.abs() + price * quantity) / total.abs();
            holding.quantity = total;
        }
        self.realized += realized;
        debug!("paper fill {side:?} {quantity} {symbol} @ {price:.4}");
    }

    fn entry_filled(&self, parent: &Option<String>) -> bool {
        match parent {
            None => true,
            Some(id) => self
                .orders
                .iter()
                .any(|o| o.order.id == *id && o.order.status == OrderStatus::Filled),
        }
    }
}

pub struct PaperBroker {
    book: Mutex<Book>,
    settings: PaperSettings,
}

impl PaperBroker {
    pub fn new(settings: PaperSettings) -> Self {
        PaperBroker {
            book: Mutex::new(Book::default()),
            settings,
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.book().prices.get(symbol).copied()
    }

    /// Record a bar's close as the last price and fill any resting order the
    /// bar traded through.
    pub fn mark(&self, bar: &Bar) {
        let mut book = self.book();
        book.prices.insert(bar.symbol.clone(), bar.close);

        let mut fills: Vec<(usize, f64)> = Vec::new();
        for (index, paper) in book.orders.iter().enumerate() {
            if paper.order.symbol != bar.symbol
                || !paper.order.status.is_open()
                || !book.entry_filled(&paper.parent)
            {
                continue;
            }
            let side = paper.order.side;
            let fill = match paper.role {
                Role::Entry { limit: Some(limit) } => match side {
                    Side::Buy if bar.low <= limit => Some(limit),
                    Side::Sell if bar.high >= limit => Some(limit),
                    _ => None,
                },
                Role::Entry { limit: None } => Some(bar.close),
                Role::StopLoss { price } => match side {
                    Side::Sell if bar.low <= price => Some(price),
                    Side::Buy if bar.high >= price => Some(price),
                    _ => None,
                },
                Role::TakeProfit { price } => match side {
                    Side::Sell if bar.high >= price => Some(price),
                    Side::Buy if bar.low <= price => Some(price),
                    _ => None,
                },
            };
            if let Some(price) = fill {
                fills.push((index, price));
            }
        }

        for (index, price) in fills {
            if !book.orders[index].order.status.is_open() {
                continue;
            }
            let paper = book.orders[index].clone();
            book.orders[index].order.status = OrderStatus::Filled;
            book.apply_fill(
                &paper.order.symbol,
                paper.order.side,
                paper.order.quantity,
                price,
                self.settings.commission_per_trade,
            );
            if let (Role::StopLoss { .. } | Role::TakeProfit { .. }, Some(parent)) =
                (paper.role, &paper.parent)
            {
                for sibling in book.orders.iter_mut() {
                    if sibling.parent.as_ref() == Some(parent)
                        && sibling.order.id != paper.order.id
                        && sibling.order.status.is_open()
                    {
                        sibling.order.status = OrderStatus::Cancelled;
                    }
                }
            }
        }
    }

    fn working(&self, book: &mut Book, symbol: &str, side: Side, quantity: f64, role: Role, parent: Option<String>) -> Order {
        let order = Order {
            id: book.next_order_id(),
            symbol: symbol.to_string(),
            side,
            quantity,
            status: OrderStatus::Working,
        };
        book.orders.push(PaperOrder {
            order: order.clone(),
            role,
            parent,
        });
        order
    }
}

impl BrokerPort for PaperBroker {
    fn submit_order_plan(
        &self,
        plan: &OrderPlan,
        env: TradingEnv,
    ) -> Result<Vec<Order>, LifecycleError> {
        if env != TradingEnv::Paper {
            return Err(LifecycleError::Broker {
                reason: format!("paper broker cannot trade in {env} environment"),
            });
        }
        if !(plan.quantity > 0.0) {
            return Err(LifecycleError::Broker {
                reason: format!("invalid quantity {}", plan.quantity),
            });
        }

        let mut book = self.book();
        let limit = match plan.entry {
            EntryType::Market => None,
            EntryType::Limit { price } => Some(price),
        };
        let market_fill = match limit {
            Some(_) => None,
            None => {
                let price = *book.prices.get(&plan.symbol).ok_or_else(|| LifecycleError::Broker {
                    reason: format!("no price for {}", plan.symbol),
                })?;
                Some(slipped(price, plan.side, self.settings.slippage_pct))
            }
        };

        let mut entry = self.working(
            &mut book,
            &plan.symbol,
            plan.side,
            plan.quantity,
            Role::Entry { limit },
            None,
        );
        if let Some(fill) = market_fill {
            book.apply_fill(
                &plan.symbol,
                plan.side,
                plan.quantity,
                fill,
                self.settings.commission_per_trade,
            );
            entry.status = OrderStatus::Filled;
            if let Some(last) = book.orders.last_mut() {
                last.order.status = OrderStatus::Filled;
            }
        }

        let mut orders = vec![entry.clone()];
        let exit_side = plan.side.opposite();
        if let Some(price) = plan.stop_loss {
            orders.push(self.working(
                &mut book,
                &plan.symbol,
                exit_side,
                plan.quantity,
                Role::StopLoss { price },
                Some(entry.id.clone()),
            ));
        }
        if let Some(price) = plan.take_profit {
            orders.push(self.working(
                &mut book,
                &plan.symbol,
                exit_side,
                plan.quantity,
                Role::TakeProfit { price },
                Some(entry.id.clone()),
            ));
        }
        info!(
            "paper {:?} {} {} ({} order(s), entry {:?})",
            plan.side,
            plan.quantity,
            plan.symbol,
            orders.len(),
            entry.status
        );
        Ok(orders)
    }

    fn cancel_open_entries(
        &self,
        symbol: &str,
        orders: &[Order],
        _env: TradingEnv,
    ) -> Result<CancelReport, LifecycleError> {
        let mut book = self.book();
        let mut report = CancelReport::default();
        for requested in orders {
            let found = book
                .orders
                .iter_mut()
                .find(|o| o.order.id == requested.id && o.order.symbol == symbol);
            match found {
                Some(paper) if paper.order.status.is_open() => {
                    paper.order.status = OrderStatus::Cancelled;
                    report.succeeded.push(requested.id.clone());
                }
                Some(paper) => report.failed.push(CancelFailure {
                    order_id: requested.id.clone(),
                    reason: format!("order is {:?}", paper.order.status).to_lowercase(),
                }),
                None => report.failed.push(CancelFailure {
                    order_id: requested.id.clone(),
                    reason: "unknown order".to_string(),
                }),
            }
        }
        Ok(report)
    }

    fn get_open_orders(&self, symbol: &str, _env: TradingEnv) -> Result<Vec<Order>, LifecycleError> {
        Ok(self
            .book()
            .orders
            .iter()
            .filter(|o| o.order.symbol == symbol && o.order.status.is_open())
            .map(|o| o.order.clone())
            .collect())
    }
}

impl PositionSource for PaperBroker {
    fn net_quantity(&self, symbol: &str, _fresh: bool) -> Result<f64, LifecycleError> {
        Ok(self
            .book()
            .holdings
            .get(symbol)
            .map_or(0.0, |h| h.quantity))
    }

    fn daily_pnl(&self) -> Result<f64, LifecycleError> {
        let book = self.book();
        let unrealized: f64 = book
            .holdings
            .iter()
            .filter_map(|(symbol, h)| {
                book.prices
                    .get(symbol)
                    .map(|price| (price - h.avg_price) * h.quantity)
            })
            .sum();
        Ok(book.realized + unrealized)
    }
}

/// Marks every bar it fetches on the paper broker before handing it on.
pub struct MarkingBarSource<B> {
    inner: B,
    broker: Arc<PaperBroker>,
}

impl<B: BarSource> MarkingBarSource<B> {
    pub fn new(inner: B, broker: Arc<PaperBroker>) -> Self {
        MarkingBarSource { inner, broker }
    }
}

impl<B: BarSource> BarSource for MarkingBarSource<B> {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>, LifecycleError> {
        let bars = self.inner.fetch_bars(symbol, timeframe, since)?;
        for bar in &bars {
            self.broker.mark(bar);
        }
        Ok(bars)
    }
}
