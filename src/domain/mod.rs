//! Core domain types and logic.

pub mod audit;
pub mod bar;
pub mod config_validation;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod expr;
pub mod expr_eval;
pub mod expr_parser;
pub mod feature;
pub mod lifecycle;
pub mod lock;
pub mod operation;
pub mod order;
pub mod orchestrator;
pub mod program;
pub mod queue;
pub mod risk;
pub mod strategy;
