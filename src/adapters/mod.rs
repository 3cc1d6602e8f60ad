//! Concrete adapter implementations for ports.

pub mod cached_portfolio;
pub mod csv_adapter;
pub mod file_config_adapter;
pub mod file_evaluator;
pub mod log_audit;
pub mod memory_lock;
pub mod paper_broker;
#[cfg(feature = "postgres")]
pub mod postgres_adapter;
#[cfg(feature = "sqlite")]
pub mod sqlite;
