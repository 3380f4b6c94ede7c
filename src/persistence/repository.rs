//! Database Repository
//!
//! SQLite implementations of the domain storage traits.

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::broker_connection::{BrokerConnection, TokenSet};
use crate::domain::entities::execution_intent::{ExecutionIntent, IntentPhase};
use crate::domain::entities::position::{
    NewPosition, PositionClose, PositionRecord, PositionSnapshot,
};
use crate::domain::errors::PersistenceError;
use crate::domain::repositories::audit_repository::{AuditEvent, AuditRepository};
use crate::domain::repositories::connection_repository::ConnectionRepository;
use crate::domain::repositories::intent_repository::IntentRepository;
use crate::domain::repositories::position_repository::PositionRepository;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

const POSITION_COLUMNS: &str = "id, symbol, exchange_id, side, status, entry_price, entry_time, \
     exit_price, exit_time, pnl_percentage, source, exit_reason, quantity, mark_price, \
     unrealized_pnl_pct, metadata";

fn rows_to_records(rows: Vec<PositionRow>) -> Result<Vec<PositionRecord>, PersistenceError> {
    rows.into_iter().map(PositionRecord::try_from).collect()
}

/// Position repository
pub struct SqlitePositionRepository {
    pool: DbPool,
}

impl SqlitePositionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn insert_open(
        &self,
        position: &NewPosition,
    ) -> Result<Option<PositionRecord>, PersistenceError> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let sql = format!(
            r#"
            INSERT INTO positions (
                id, symbol, exchange_id, side, status, entry_price, entry_time, source,
                quantity, mark_price, unrealized_pnl_pct, metadata, created_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, 'open', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12
            WHERE NOT EXISTS (
                SELECT 1 FROM positions
                WHERE symbol = ?2 AND exchange_id = ?3 AND status = 'open'
            )
            RETURNING {}
            "#,
            POSITION_COLUMNS
        );
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(&id)
            .bind(&position.symbol)
            .bind(&position.exchange_id)
            .bind(position.side.as_db_str())
            .bind(position.entry_price)
            .bind(position.entry_time)
            .bind(position.source.as_str())
            .bind(position.quantity)
            .bind(position.mark_price)
            .bind(position.unrealized_pnl_pct)
            .bind(&position.metadata)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to create position: {}", e);
                DatabaseError::QueryError(format!("Failed to create position: {}", e))
            })?;

        match row {
            Some(row) => {
                debug!("Created position: {} for {}", row.id, row.symbol);
                Ok(Some(row.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<PositionRecord>, PersistenceError> {
        let sql = format!("SELECT {} FROM positions WHERE id = ?1", POSITION_COLUMNS);
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get position {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get position: {}", e))
            })?;

        row.map(PositionRecord::try_from).transpose()
    }

    async fn find_open(
        &self,
        symbol: &str,
        exchange_id: &str,
    ) -> Result<Vec<PositionRecord>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE symbol = ?1 AND exchange_id = ?2 AND status = 'open' \
             ORDER BY entry_time DESC, created_at DESC, rowid DESC",
            POSITION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(symbol)
            .bind(exchange_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get open positions for {}: {}", symbol, e);
                DatabaseError::QueryError(format!("Failed to get open positions: {}", e))
            })?;

        rows_to_records(rows)
    }

    async fn find_all_open(&self, exchange_id: &str) -> Result<Vec<PositionRecord>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE exchange_id = ?1 AND status = 'open' \
             ORDER BY symbol, entry_time DESC",
            POSITION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(exchange_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get open positions for {}: {}", exchange_id, e);
                DatabaseError::QueryError(format!("Failed to get open positions: {}", e))
            })?;

        rows_to_records(rows)
    }

    async fn find_history(
        &self,
        symbol: &str,
        exchange_id: &str,
    ) -> Result<Vec<PositionRecord>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE symbol = ?1 AND exchange_id = ?2 \
             ORDER BY entry_time DESC, created_at DESC, rowid DESC",
            POSITION_COLUMNS
        );
        let rows = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(symbol)
            .bind(exchange_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get positions for {}: {}", symbol, e);
                DatabaseError::QueryError(format!("Failed to get positions: {}", e))
            })?;

        rows_to_records(rows)
    }

    async fn close_if_open(&self, id: &str, close: &PositionClose) -> Result<bool, PersistenceError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed', exit_price = ?1, exit_time = ?2, pnl_percentage = ?3,
                exit_reason = ?4, updated_at = ?5
            WHERE id = ?6 AND status = 'open'
            "#,
        )
        .bind(close.exit_price)
        .bind(close.exit_time)
        .bind(close.pnl_percentage)
        .bind(&close.exit_reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to close position {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to close position: {}", e))
        })?
        .rows_affected();

        debug!("Close position {}: {} row(s) affected", id, rows_affected);
        Ok(rows_affected > 0)
    }

    async fn update_snapshot_if_open(
        &self,
        id: &str,
        snapshot: &PositionSnapshot,
    ) -> Result<bool, PersistenceError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET quantity = ?1, mark_price = ?2, unrealized_pnl_pct = ?3, metadata = ?4,
                updated_at = ?5
            WHERE id = ?6 AND status = 'open'
            "#,
        )
        .bind(snapshot.quantity)
        .bind(snapshot.mark_price)
        .bind(snapshot.unrealized_pnl_pct)
        .bind(&snapshot.metadata)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update position {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to update position: {}", e))
        })?
        .rows_affected();

        debug!("Updated position snapshot: {}", id);
        Ok(rows_affected > 0)
    }
}

/// Broker connection repository
pub struct SqliteConnectionRepository {
    pool: DbPool,
}

impl SqliteConnectionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const CONNECTION_COLUMNS: &str = "id, user_id, broker_type, access_token, refresh_token, \
     token_expiry, account_ref, auto_sync_enabled, is_valid";

#[async_trait]
impl ConnectionRepository for SqliteConnectionRepository {
    async fn get(&self, id: &str) -> Result<Option<BrokerConnection>, PersistenceError> {
        let sql = format!("SELECT {} FROM broker_connections WHERE id = ?1", CONNECTION_COLUMNS);
        let row = sqlx::query_as::<_, BrokerConnectionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get broker connection {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get broker connection: {}", e))
            })?;

        row.map(BrokerConnection::try_from).transpose()
    }

    async fn list_auto_sync(&self) -> Result<Vec<BrokerConnection>, PersistenceError> {
        let sql = format!(
            "SELECT {} FROM broker_connections WHERE auto_sync_enabled = 1 AND is_valid = 1 ORDER BY id",
            CONNECTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, BrokerConnectionRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list broker connections: {}", e);
                DatabaseError::QueryError(format!("Failed to list broker connections: {}", e))
            })?;

        rows.into_iter().map(BrokerConnection::try_from).collect()
    }

    async fn save(&self, connection: &BrokerConnection) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO broker_connections (
                id, user_id, broker_type, access_token, refresh_token, token_expiry,
                account_ref, auto_sync_enabled, is_valid, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                broker_type = excluded.broker_type,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expiry = excluded.token_expiry,
                account_ref = excluded.account_ref,
                auto_sync_enabled = excluded.auto_sync_enabled,
                is_valid = excluded.is_valid,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.user_id)
        .bind(connection.broker_type.as_str())
        .bind(connection.tokens.access_token.as_str())
        .bind(connection.tokens.refresh_token.as_str())
        .bind(connection.tokens.expires_at)
        .bind(&connection.account_ref)
        .bind(connection.auto_sync_enabled)
        .bind(connection.is_valid)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save broker connection {}: {}", connection.id, e);
            DatabaseError::QueryError(format!("Failed to save broker connection: {}", e))
        })?;

        debug!("Saved broker connection: {}", connection.id);
        Ok(())
    }

    async fn store_tokens(&self, id: &str, tokens: &TokenSet) -> Result<(), PersistenceError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE broker_connections
            SET access_token = ?1, refresh_token = ?2, token_expiry = ?3, is_valid = 1,
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(tokens.access_token.as_str())
        .bind(tokens.refresh_token.as_str())
        .bind(tokens.expires_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store tokens for {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to store tokens: {}", e))
        })?
        .rows_affected();

        if rows_affected == 0 {
            return Err(PersistenceError(format!("Broker connection not found: {}", id)));
        }
        debug!("Stored refreshed tokens for connection {}", id);
        Ok(())
    }

    async fn mark_invalid(&self, id: &str) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE broker_connections SET is_valid = 0, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to invalidate connection {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to invalidate connection: {}", e))
            })?;
        Ok(())
    }
}

/// Reversal intent repository
pub struct SqliteIntentRepository {
    pool: DbPool,
}

impl SqliteIntentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IntentRepository for SqliteIntentRepository {
    async fn insert(&self, intent: &ExecutionIntent) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO execution_intents (
                id, symbol, exchange_id, target_side, phase, price_hint, reason_tag,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.symbol)
        .bind(&intent.exchange_id)
        .bind(intent.target_side.as_db_str())
        .bind(intent.phase.as_str())
        .bind(intent.price_hint)
        .bind(&intent.reason_tag)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record intent for {}: {}", intent.symbol, e);
            DatabaseError::QueryError(format!("Failed to record intent: {}", e))
        })?;
        Ok(())
    }

    async fn update_phase(&self, id: &str, phase: IntentPhase) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE execution_intents SET phase = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(phase.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update intent {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to update intent: {}", e))
            })?;
        debug!("Intent {} -> {}", id, phase.as_str());
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<ExecutionIntent>, PersistenceError> {
        let rows = sqlx::query_as::<_, ExecutionIntentRow>(
            r#"
            SELECT id, symbol, exchange_id, target_side, phase, price_hint, reason_tag,
                   created_at, updated_at
            FROM execution_intents
            WHERE phase IN ('pending', 'closed')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list intents: {}", e);
            DatabaseError::QueryError(format!("Failed to list intents: {}", e))
        })?;

        rows.into_iter().map(ExecutionIntent::try_from).collect()
    }
}

/// Audit log repository
pub struct AuditLogRepository {
    pool: DbPool,
}

impl AuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get recent audit logs by event type
    pub async fn get_by_event_type(
        &self,
        event_type: &str,
        limit: i64,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AuditLogRecord>(
            "SELECT * FROM audit_log WHERE event_type = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )
        .bind(event_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get audit logs for event type {}: {}", event_type, e);
            DatabaseError::QueryError(format!("Failed to get audit logs: {}", e))
        })?;

        Ok(records)
    }
}

#[async_trait]
impl AuditRepository for AuditLogRepository {
    async fn record(&self, event: AuditEvent) -> Result<(), PersistenceError> {
        let details_json = serde_json::to_string(&event.details)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize details: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (event_type, exchange, symbol, details, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.exchange)
        .bind(&event.symbol)
        .bind(&details_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create audit log: {}", e);
            DatabaseError::QueryError(format!("Failed to create audit log: {}", e))
        })?;

        debug!("Created audit log: {} for {}", event.event_type, event.exchange);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::broker_connection::BrokerType;
    use crate::domain::entities::directive::Side;
    use crate::domain::entities::position::{PositionSource, PositionStatus};
    use crate::persistence::init_database;
    use chrono::Duration;

    fn new_position(symbol: &str, side: Side) -> NewPosition {
        NewPosition::new(symbol, "bybit", side, 100.0, Utc::now(), PositionSource::Signal)
    }

    #[tokio::test]
    async fn test_position_lifecycle() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqlitePositionRepository::new(pool);

        let created = repo.insert_open(&new_position("BTCUSDT", Side::Long)).await.unwrap().unwrap();
        assert_eq!(created.status, PositionStatus::Open);
        assert_eq!(created.side, Side::Long);

        let fetched = repo.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.symbol, "BTCUSDT");

        let close = PositionClose {
            exit_price: Some(110.0),
            exit_time: Utc::now(),
            pnl_percentage: Some(10.0),
            exit_reason: "signal".to_string(),
        };
        assert!(repo.close_if_open(&created.id, &close).await.unwrap());
        assert!(!repo.close_if_open(&created.id, &close).await.unwrap());

        let closed = repo.get(&created.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.pnl_percentage, Some(10.0));
        assert!(repo.find_open("BTCUSDT", "bybit").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_insert() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqlitePositionRepository::new(pool);

        assert!(repo.insert_open(&new_position("ETHUSDT", Side::Long)).await.unwrap().is_some());
        assert!(repo.insert_open(&new_position("ETHUSDT", Side::Short)).await.unwrap().is_none());
        assert!(repo.insert_open(&new_position("SOLUSDT", Side::Short)).await.unwrap().is_some());
        assert_eq!(repo.find_all_open("bybit").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_update_requires_open_row() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqlitePositionRepository::new(pool);
        let created = repo.insert_open(&new_position("AAPL", Side::Long)).await.unwrap().unwrap();

        let snapshot = PositionSnapshot {
            quantity: Some(5.0),
            mark_price: Some(101.0),
            unrealized_pnl_pct: Some(1.0),
            metadata: None,
        };
        assert!(repo.update_snapshot_if_open(&created.id, &snapshot).await.unwrap());

        let close = PositionClose {
            exit_price: None,
            exit_time: Utc::now(),
            pnl_percentage: None,
            exit_reason: "closed_externally".to_string(),
        };
        repo.close_if_open(&created.id, &close).await.unwrap();
        assert!(!repo.update_snapshot_if_open(&created.id, &snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_tokens_round_trip() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqliteConnectionRepository::new(pool);
        let expiry = Utc::now() + Duration::hours(1);
        let connection = BrokerConnection {
            id: "conn-1".to_string(),
            user_id: "user-1".to_string(),
            broker_type: BrokerType::Alpaca,
            tokens: TokenSet::new("a1".to_string(), "r1".to_string(), expiry),
            account_ref: Some("ACC1".to_string()),
            auto_sync_enabled: true,
            is_valid: true,
        };
        repo.save(&connection).await.unwrap();

        let new_expiry = expiry + Duration::hours(1);
        repo.store_tokens("conn-1", &TokenSet::new("a2".to_string(), "r2".to_string(), new_expiry))
            .await
            .unwrap();
        let stored = repo.get("conn-1").await.unwrap().unwrap();
        assert_eq!(stored.tokens.access_token.as_str(), "a2");
        assert_eq!(stored.tokens.refresh_token.as_str(), "r2");
        assert_eq!(stored.tokens.expires_at.timestamp(), new_expiry.timestamp());

        repo.mark_invalid("conn-1").await.unwrap();
        assert!(!repo.get("conn-1").await.unwrap().unwrap().is_valid);
        assert!(repo.list_auto_sync().await.unwrap().is_empty());
        assert!(repo.store_tokens("missing", &stored.tokens).await.is_err());
    }

    #[tokio::test]
    async fn test_intent_phases() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SqliteIntentRepository::new(pool);
        let intent = ExecutionIntent::reversal("BTCUSDT", "bybit", Side::Short, Some(100.0), None);
        repo.insert(&intent).await.unwrap();

        repo.update_phase(&intent.id, IntentPhase::Closed).await.unwrap();
        let pending = repo.list_unfinished().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, IntentPhase::Closed);
        assert_eq!(pending[0].target_side, Side::Short);

        repo.update_phase(&intent.id, IntentPhase::Completed).await.unwrap();
        assert!(repo.list_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_log() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = AuditLogRepository::new(pool);
        repo.record(
            AuditEvent::new("directive_rejected", "*", serde_json::json!({"raw": "gibberish"}))
                .with_symbol("BTCUSD"),
        )
        .await
        .unwrap();
        let logs = repo.get_by_event_type("directive_rejected", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].details.contains("gibberish"));
    }
}
