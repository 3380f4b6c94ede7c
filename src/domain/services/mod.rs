pub mod broker_reconciler;
pub mod directive_parser;
pub mod order_executor;
pub mod position_resolver;
pub mod retry;
pub mod signal_ledger;
pub mod symbol_locks;
pub mod token_manager;
