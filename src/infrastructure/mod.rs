//! Venue and broker adapters behind the domain client traits.

pub mod brokers;
pub mod bybit_client;
pub mod exchange_client_factory;
pub mod paper_exchange;
