//! alertdesk
//!
//! Turns trading-alert directives into exchange orders, keeps a signal ledger
//! of the resulting positions and reconciles that ledger with broker accounts.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod task_runner;
