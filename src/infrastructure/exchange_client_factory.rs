//! Client factories
//!
//! Builds one shared client per configured exchange and per broker vendor.
//! Exchanges without usable credentials are skipped with an error log so the
//! rest of the desk still starts.

use crate::config::AppConfig;
use crate::domain::entities::exchange::ExchangeConfig;
use crate::domain::repositories::broker_client::BrokerClientRegistry;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::order_executor::ExchangeTarget;
use crate::infrastructure::brokers::alpaca::{AlpacaClient, AlpacaEndpoints};
use crate::infrastructure::brokers::tradestation::{TradeStationClient, TradeStationEndpoints};
use crate::infrastructure::bybit_client::BybitClient;
use crate::infrastructure::paper_exchange::{PaperExchange, DEFAULT_PAPER_EQUITY};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Factory for creating exchange clients
pub struct ExchangeClientFactory;

impl ExchangeClientFactory {
    /// Create a client for every configured exchange, keyed by exchange id
    pub fn create_all(config: &AppConfig) -> HashMap<String, ExchangeTarget> {
        let mut targets = HashMap::new();

        for exchange in &config.exchanges {
            if !exchange.is_active {
                info!("Exchange {} is inactive, skipping client", exchange.exchange_id);
                continue;
            }
            match Self::create(exchange, config) {
                Some(client) => {
                    targets.insert(
                        exchange.exchange_id.clone(),
                        ExchangeTarget {
                            config: exchange.clone(),
                            client,
                        },
                    );
                }
                None => error!("✗ No client for exchange {}", exchange.exchange_id),
            }
        }

        info!("ExchangeClientFactory created {} exchange clients", targets.len());
        targets
    }

    /// Create a specific exchange client
    pub fn create(exchange: &ExchangeConfig, config: &AppConfig) -> Option<Arc<dyn ExchangeClient>> {
        match exchange.exchange_id.as_str() {
            "bybit" => Self::create_bybit_client(config),
            id if id == "paper" || id.starts_with("paper-") => {
                info!("✓ Paper exchange {} created", id);
                Some(Arc::new(PaperExchange::new(id, DEFAULT_PAPER_EQUITY)) as Arc<dyn ExchangeClient>)
            }
            other => {
                warn!("Exchange {} not supported", other);
                None
            }
        }
    }

    fn create_bybit_client(config: &AppConfig) -> Option<Arc<dyn ExchangeClient>> {
        let Some(credentials) = config.bybit.as_ref() else {
            warn!("BYBIT_API_KEY / BYBIT_API_SECRET not set, Bybit client not created");
            return None;
        };
        match BybitClient::new(credentials, config.upstream_timeout()) {
            Ok(client) => {
                info!("✓ Bybit client created (testnet: {})", credentials.testnet);
                Some(Arc::new(client) as Arc<dyn ExchangeClient>)
            }
            Err(e) => {
                error!("✗ Failed to create Bybit client: {}", e);
                None
            }
        }
    }
}

/// Factory for broker clients used by reconciliation and token refresh
pub struct BrokerClientFactory;

impl BrokerClientFactory {
    pub fn create_all(config: &AppConfig) -> BrokerClientRegistry {
        let mut registry = BrokerClientRegistry::new();

        match config.alpaca.clone() {
            Some(credentials) => {
                match AlpacaClient::new(credentials, AlpacaEndpoints::live(), config.upstream_timeout()) {
                    Ok(client) => {
                        info!("✓ Alpaca client created");
                        registry.register(Arc::new(client));
                    }
                    Err(e) => error!("✗ Failed to create Alpaca client: {}", e),
                }
            }
            None => warn!("ALPACA_CLIENT_ID not set, Alpaca client not created"),
        }

        match config.tradestation.clone() {
            Some(credentials) => match TradeStationClient::new(
                credentials,
                TradeStationEndpoints::live(),
                config.upstream_timeout(),
            ) {
                Ok(client) => {
                    info!("✓ TradeStation client created");
                    registry.register(Arc::new(client));
                }
                Err(e) => error!("✗ Failed to create TradeStation client: {}", e),
            },
            None => warn!("TRADESTATION_CLIENT_ID not set, TradeStation client not created"),
        }

        registry
    }
}
