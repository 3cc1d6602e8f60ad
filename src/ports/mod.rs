//! Port traits consumed by the domain layer.

pub mod audit_port;
pub mod broker_port;
pub mod clock_port;
pub mod config_port;
pub mod data_port;
pub mod evaluator_port;
pub mod lock_port;
pub mod operation_store_port;
pub mod portfolio_port;
pub mod strategy_store_port;
