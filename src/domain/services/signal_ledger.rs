//! Signal ledger
//!
//! The persisted record of opened and closed positions. Owns PnL accounting
//! and the at-most-one-open-row-per-`(symbol, exchange)` invariant.

use crate::domain::entities::directive::Side;
use crate::domain::entities::position::{
    NewPosition, PositionClose, PositionRecord, PositionSnapshot,
};
use crate::domain::errors::PersistenceError;
use crate::domain::repositories::audit_repository::{
    AuditEvent, AuditRepository, EVENT_DUPLICATE_OPEN_ROWS,
};
use crate::domain::repositories::position_repository::PositionRepository;
use crate::domain::value_objects::pnl::PnlPercentage;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SignalLedger {
    positions: Arc<dyn PositionRepository>,
    audit: Arc<dyn AuditRepository>,
}

impl SignalLedger {
    pub fn new(positions: Arc<dyn PositionRepository>, audit: Arc<dyn AuditRepository>) -> Self {
        Self { positions, audit }
    }

    /// Side of the open row for the key, `Flat` when there is none
    pub async fn current_side(&self, symbol: &str, exchange_id: &str) -> Result<Side, PersistenceError> {
        let open = self.positions.find_open(symbol, exchange_id).await?;
        Ok(open.first().map(|p| p.side).unwrap_or(Side::Flat))
    }

    pub async fn find_open(
        &self,
        symbol: &str,
        exchange_id: &str,
    ) -> Result<Option<PositionRecord>, PersistenceError> {
        Ok(self.positions.find_open(symbol, exchange_id).await?.into_iter().next())
    }

    pub async fn find_all_open(&self, exchange_id: &str) -> Result<Vec<PositionRecord>, PersistenceError> {
        self.positions.find_all_open(exchange_id).await
    }

    /// Insert an open row. Returns `None` when an open row already existed.
    pub async fn open_position(
        &self,
        position: NewPosition,
    ) -> Result<Option<PositionRecord>, PersistenceError> {
        if position.side.is_flat() {
            return Err(PersistenceError(format!(
                "refusing to open a flat position for {}",
                position.symbol
            )));
        }
        let inserted = self.positions.insert_open(&position).await?;
        match &inserted {
            Some(record) => info!(
                symbol = %record.symbol,
                exchange = %record.exchange_id,
                side = %record.side,
                entry_price = record.entry_price,
                source = %record.source,
                "Ledger position opened"
            ),
            None => warn!(
                symbol = %position.symbol,
                exchange = %position.exchange_id,
                "Open row already exists; conditional insert skipped"
            ),
        }
        Ok(inserted)
    }

    /// Close the open row for the key.
    ///
    /// No open row is a no-op returning `None`. With several open rows the most
    /// recent one is closed and the others are flagged in the audit log.
    pub async fn close_position(
        &self,
        symbol: &str,
        exchange_id: &str,
        exit_price: Option<f64>,
        exit_time: DateTime<Utc>,
        exit_reason: &str,
    ) -> Result<Option<PositionRecord>, PersistenceError> {
        let open = self.positions.find_open(symbol, exchange_id).await?;
        let Some(target) = open.first() else {
            debug!(symbol, exchange = exchange_id, "No open row to close");
            return Ok(None);
        };

        if open.len() > 1 {
            let ignored: Vec<&str> = open[1..].iter().map(|p| p.id.as_str()).collect();
            warn!(
                symbol,
                exchange = exchange_id,
                closing = %target.id,
                ignored = ?ignored,
                "Multiple open rows for one key; closing the most recent"
            );
            let event = AuditEvent::new(
                EVENT_DUPLICATE_OPEN_ROWS,
                exchange_id,
                json!({ "closed": target.id, "ignored": ignored }),
            )
            .with_symbol(symbol);
            if let Err(e) = self.audit.record(event).await {
                warn!("Failed to audit duplicate open rows: {}", e);
            }
        }

        if !self.close_record(target, exit_price, exit_time, exit_reason).await? {
            return Ok(None);
        }
        self.positions.get(&target.id).await
    }

    /// Close a specific row if it is still open. Returns whether it was closed.
    pub async fn close_record(
        &self,
        record: &PositionRecord,
        exit_price: Option<f64>,
        exit_time: DateTime<Utc>,
        exit_reason: &str,
    ) -> Result<bool, PersistenceError> {
        let pnl_percentage = exit_price.and_then(|exit| {
            PnlPercentage::compute(record.side, record.entry_price, exit)
                .map(|p| p.value())
                .map_err(|e| warn!(id = %record.id, "PnL not computed: {}", e))
                .ok()
        });

        let close = PositionClose {
            exit_price,
            exit_time,
            pnl_percentage,
            exit_reason: exit_reason.to_string(),
        };
        let closed = self.positions.close_if_open(&record.id, &close).await?;
        if closed {
            info!(
                symbol = %record.symbol,
                exchange = %record.exchange_id,
                exit_reason,
                pnl_percentage = ?pnl_percentage,
                "Ledger position closed"
            );
        } else {
            debug!(id = %record.id, "Row no longer open; close skipped");
        }
        Ok(closed)
    }

    /// Refresh broker-reported fields on a row that is still open
    pub async fn update_snapshot(
        &self,
        record: &PositionRecord,
        snapshot: &PositionSnapshot,
    ) -> Result<bool, PersistenceError> {
        self.positions.update_snapshot_if_open(&record.id, snapshot).await
    }

    pub async fn history(&self, symbol: &str, exchange_id: &str) -> Result<Vec<PositionRecord>, PersistenceError> {
        self.positions.find_history(symbol, exchange_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{PositionSource, PositionStatus};
    use crate::persistence::init_database;
    use crate::persistence::repository::{AuditLogRepository, SqlitePositionRepository};

    async fn ledger() -> (SignalLedger, AuditLogRepository) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let audit = AuditLogRepository::new(pool.clone());
        let ledger = SignalLedger::new(
            Arc::new(SqlitePositionRepository::new(pool.clone())),
            Arc::new(AuditLogRepository::new(pool)),
        );
        (ledger, audit)
    }

    fn long(symbol: &str, entry: f64) -> NewPosition {
        NewPosition::new(symbol, "paper", Side::Long, entry, Utc::now(), PositionSource::Signal)
    }

    #[tokio::test]
    async fn test_current_side_defaults_to_flat() {
        let (ledger, _) = ledger().await;
        assert_eq!(ledger.current_side("BTCUSD", "paper").await.unwrap(), Side::Flat);
        ledger.open_position(long("BTCUSD", 100.0)).await.unwrap();
        assert_eq!(ledger.current_side("BTCUSD", "paper").await.unwrap(), Side::Long);
        assert_eq!(ledger.current_side("BTCUSD", "bybit").await.unwrap(), Side::Flat);
    }

    #[tokio::test]
    async fn test_conditional_insert_refuses_second_open_row() {
        let (ledger, _) = ledger().await;
        assert!(ledger.open_position(long("BTCUSD", 100.0)).await.unwrap().is_some());
        assert!(ledger.open_position(long("BTCUSD", 101.0)).await.unwrap().is_none());
        assert_eq!(ledger.history("BTCUSD", "paper").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_computes_pnl() {
        let (ledger, _) = ledger().await;
        ledger.open_position(long("BTCUSD", 45_000.0)).await.unwrap();
        let closed = ledger
            .close_position("BTCUSD", "paper", Some(44_800.0), Utc::now(), "ma_cross")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason.as_deref(), Some("ma_cross"));
        let pnl = closed.pnl_percentage.unwrap();
        assert!((pnl + 0.4444).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_close_without_exit_price_leaves_pnl_empty() {
        let (ledger, _) = ledger().await;
        ledger.open_position(long("ETHUSD", 2_000.0)).await.unwrap();
        let closed = ledger
            .close_position("ETHUSD", "paper", None, Utc::now(), "signal")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.exit_price, None);
        assert_eq!(closed.pnl_percentage, None);
    }

    #[tokio::test]
    async fn test_close_with_no_open_row_is_noop() {
        let (ledger, _) = ledger().await;
        let result = ledger
            .close_position("BTCUSD", "paper", Some(1.0), Utc::now(), "signal")
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(ledger.history("BTCUSD", "paper").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_record_respects_open_precondition() {
        let (ledger, _) = ledger().await;
        let record = ledger.open_position(long("BTCUSD", 100.0)).await.unwrap().unwrap();
        assert!(ledger.close_record(&record, Some(110.0), Utc::now(), "signal").await.unwrap());
        assert!(!ledger
            .close_record(&record, Some(90.0), Utc::now(), "closed_externally")
            .await
            .unwrap());
        let stored = ledger.history("BTCUSD", "paper").await.unwrap();
        assert_eq!(stored[0].exit_reason.as_deref(), Some("signal"));
        assert_eq!(stored[0].exit_price, Some(110.0));
    }

    #[tokio::test]
    async fn test_refuses_flat_open() {
        let (ledger, _) = ledger().await;
        let flat = NewPosition::new("BTCUSD", "paper", Side::Flat, 1.0, Utc::now(), PositionSource::Manual);
        assert!(ledger.open_position(flat).await.is_err());
    }
}
