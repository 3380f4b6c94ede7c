//! Paper exchange
//!
//! In-memory `ExchangeClient` used when no live exchange credentials are
//! configured. Orders fill instantly at the last price fed through
//! `update_price`; without a price the fill price is left to the caller.

use crate::domain::entities::directive::Side;
use crate::domain::errors::UpstreamError;
use crate::domain::repositories::exchange_client::{
    CloseAck, ExchangeClient, ExchangePosition, ExchangeResult, OrderAck, OrderRequest,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_PAPER_EQUITY: f64 = 10_000.0;

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    size: f64,
    notional: f64,
    entry_price: Option<f64>,
}

#[derive(Debug, Default)]
struct PaperState {
    equity: f64,
    positions: HashMap<String, PaperPosition>,
    prices: HashMap<String, f64>,
}

pub struct PaperExchange {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>, starting_equity: f64) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PaperState {
                equity: starting_equity,
                ..PaperState::default()
            }),
        }
    }

    fn state(&self, operation: &str) -> ExchangeResult<std::sync::MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| UpstreamError::network(operation, "paper exchange state poisoned"))
    }

    /// Feed the last traded price for `symbol`
    pub fn update_price(&self, symbol: &str, price: f64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.prices.insert(symbol.to_string(), price);
        }
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<ExchangePosition> {
        let state = self.state("get_position")?;
        Ok(state
            .positions
            .get(symbol)
            .map(|p| ExchangePosition {
                side: p.side,
                size: p.size,
                entry_price: p.entry_price,
            })
            .unwrap_or_else(ExchangePosition::flat))
    }

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck> {
        if order.side.is_flat() {
            return Err(UpstreamError::rejected("place_order", "cannot open a FLAT position"));
        }
        if !(order.notional.is_finite() && order.notional > 0.0) {
            return Err(UpstreamError::rejected("place_order", "notional must be positive"));
        }

        let mut state = self.state("place_order")?;
        if let Some(existing) = state.positions.get(&order.symbol) {
            if existing.side != order.side {
                return Err(UpstreamError::rejected(
                    "place_order",
                    format!("{} already {} on paper", order.symbol, existing.side),
                ));
            }
        }

        let price = state.prices.get(&order.symbol).copied();
        let size = price.map(|p| order.notional / p).unwrap_or(order.notional);
        let position = state
            .positions
            .entry(order.symbol.clone())
            .or_insert(PaperPosition {
                side: order.side,
                size: 0.0,
                notional: 0.0,
                entry_price: price,
            });
        position.size += size;
        position.notional += order.notional;

        let order_id = format!("paper-{}", uuid::Uuid::new_v4());
        info!(
            exchange = %self.name,
            symbol = %order.symbol,
            side = %order.side,
            notional = order.notional,
            "Paper order filled"
        );
        Ok(OrderAck {
            order_id,
            avg_price: price,
        })
    }

    async fn close_position(&self, symbol: &str) -> ExchangeResult<CloseAck> {
        let mut state = self.state("close_position")?;
        let Some(position) = state.positions.remove(symbol) else {
            debug!(exchange = %self.name, symbol, "Paper close on flat symbol");
            return Ok(CloseAck {
                order_id: None,
                exit_price: None,
            });
        };

        let exit_price = state.prices.get(symbol).copied();
        if let (Some(entry), Some(exit)) = (position.entry_price, exit_price) {
            let direction = if position.side == Side::Short { -1.0 } else { 1.0 };
            let realized = direction * (exit - entry) / entry * position.notional;
            state.equity += realized;
            debug!(exchange = %self.name, symbol, realized, "Paper PnL realized");
        }

        Ok(CloseAck {
            order_id: Some(format!("paper-{}", uuid::Uuid::new_v4())),
            exit_price,
        })
    }

    async fn get_account_equity(&self) -> ExchangeResult<f64> {
        Ok(self.state("get_account_equity")?.equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(symbol: &str, side: Side, notional: f64) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            size_percent: 10.0,
            notional,
        }
    }

    #[tokio::test]
    async fn test_open_and_close_realizes_pnl() {
        let paper = PaperExchange::new("paper", 10_000.0);
        paper.update_price("BTCUSD", 100.0);

        let ack = paper.place_order(&order("BTCUSD", Side::Long, 1_000.0)).await.unwrap();
        assert_eq!(ack.avg_price, Some(100.0));
        let position = paper.get_position("BTCUSD").await.unwrap();
        assert_eq!(position.side, Side::Long);
        assert_eq!(position.size, 10.0);

        paper.update_price("BTCUSD", 110.0);
        let close = paper.close_position("BTCUSD").await.unwrap();
        assert_eq!(close.exit_price, Some(110.0));
        assert!(paper.get_position("BTCUSD").await.unwrap().is_flat());
        assert!((paper.get_account_equity().await.unwrap() - 10_100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_short_pnl_and_unknown_price() {
        let paper = PaperExchange::new("paper", 1_000.0);
        let ack = paper.place_order(&order("ETHUSD", Side::Short, 100.0)).await.unwrap();
        assert_eq!(ack.avg_price, None);
        let close = paper.close_position("ETHUSD").await.unwrap();
        assert_eq!(close.exit_price, None);
        assert_eq!(paper.get_account_equity().await.unwrap(), 1_000.0);
    }

    #[tokio::test]
    async fn test_close_flat_is_noop_and_opposite_open_rejected() {
        let paper = PaperExchange::new("paper", 1_000.0);
        let close = paper.close_position("SOLUSD").await.unwrap();
        assert!(close.order_id.is_none());

        paper.place_order(&order("SOLUSD", Side::Long, 100.0)).await.unwrap();
        let error = paper.place_order(&order("SOLUSD", Side::Short, 100.0)).await.unwrap_err();
        assert!(!error.is_transient());
    }
}
