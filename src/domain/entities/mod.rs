pub mod action_plan;
pub mod broker_connection;
pub mod directive;
pub mod exchange;
pub mod execution_intent;
pub mod position;
