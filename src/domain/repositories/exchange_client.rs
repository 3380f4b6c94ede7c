//! Exchange Client Trait
//!
//! Common interface over every venue the executor can trade on. The executor
//! only ever sees this trait, so venues can be swapped or scripted in tests.

use crate::domain::entities::directive::Side;
use crate::domain::errors::UpstreamError;
use async_trait::async_trait;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, UpstreamError>;

/// Current exposure reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub side: Side,
    /// Absolute size in base units; zero when flat
    pub size: f64,
    pub entry_price: Option<f64>,
}

impl ExchangePosition {
    pub fn flat() -> Self {
        Self {
            side: Side::Flat,
            size: 0.0,
            entry_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == Side::Flat || self.size.abs() <= f64::EPSILON
    }
}

/// Order to open exposure on one side
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    /// `Long` or `Short`
    pub side: Side,
    /// Percent of equity this order represents
    pub size_percent: f64,
    /// Quote-currency notional, `size_percent / 100 * equity`
    pub notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price when the venue reports it synchronously
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseAck {
    pub order_id: Option<String>,
    pub exit_price: Option<f64>,
}

/// Exchange client trait providing common interface for all exchanges
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Identifier matching `ExchangeConfig::exchange_id`
    fn name(&self) -> &str;

    async fn get_position(&self, symbol: &str) -> ExchangeResult<ExchangePosition>;

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Flatten the whole position on `symbol`. A successful return confirms the close.
    async fn close_position(&self, symbol: &str) -> ExchangeResult<CloseAck>;

    /// Account equity in quote currency, read fresh on every call
    async fn get_account_equity(&self) -> ExchangeResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_position() {
        assert!(ExchangePosition::flat().is_flat());
        let long = ExchangePosition {
            side: Side::Long,
            size: 0.5,
            entry_price: Some(100.0),
        };
        assert!(!long.is_flat());
    }
}
