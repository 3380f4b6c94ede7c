pub mod audit_repository;
pub mod broker_client;
pub mod connection_repository;
pub mod exchange_client;
pub mod intent_repository;
pub mod position_repository;
