pub mod directive_handler;
pub mod reconcile_handler;
