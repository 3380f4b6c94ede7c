use crate::domain::entities::position::{
    NewPosition, PositionClose, PositionRecord, PositionSnapshot,
};
use crate::domain::errors::PersistenceError;
use async_trait::async_trait;

/// Storage contract for ledger rows.
///
/// Mutations of open rows carry an optimistic `status = 'open'` precondition
/// and report whether a row was actually changed.
#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Insert an open row unless one already exists for the key.
    /// Returns `None` when the conditional insert was skipped.
    async fn insert_open(&self, position: &NewPosition)
        -> Result<Option<PositionRecord>, PersistenceError>;

    async fn get(&self, id: &str) -> Result<Option<PositionRecord>, PersistenceError>;

    /// Open rows for the key, most recent `entry_time` first
    async fn find_open(
        &self,
        symbol: &str,
        exchange_id: &str,
    ) -> Result<Vec<PositionRecord>, PersistenceError>;

    async fn find_all_open(&self, exchange_id: &str) -> Result<Vec<PositionRecord>, PersistenceError>;

    /// Every row for the key regardless of status, newest first
    async fn find_history(
        &self,
        symbol: &str,
        exchange_id: &str,
    ) -> Result<Vec<PositionRecord>, PersistenceError>;

    async fn close_if_open(&self, id: &str, close: &PositionClose) -> Result<bool, PersistenceError>;

    async fn update_snapshot_if_open(
        &self,
        id: &str,
        snapshot: &PositionSnapshot,
    ) -> Result<bool, PersistenceError>;
}
