//! Database Models
//!
//! Row structs as stored in SQLite, plus conversions into domain entities.

use crate::domain::entities::broker_connection::{BrokerConnection, TokenSet};
use crate::domain::entities::execution_intent::ExecutionIntent;
use crate::domain::entities::position::PositionRecord;
use crate::domain::errors::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

fn bad_column(column: &str, reason: String) -> PersistenceError {
    PersistenceError(format!("invalid {} column: {}", column, reason))
}

/// Position row in database
#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub id: String,
    pub symbol: String,
    pub exchange_id: String,
    pub side: String,   // "long" or "short"
    pub status: String, // "open" or "closed"
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_percentage: Option<f64>,
    pub source: String,
    pub exit_reason: Option<String>,
    pub quantity: Option<f64>,
    pub mark_price: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub metadata: Option<String>,
}

impl TryFrom<PositionRow> for PositionRecord {
    type Error = PersistenceError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        Ok(PositionRecord {
            side: row.side.parse().map_err(|e| bad_column("side", e))?,
            status: row.status.parse().map_err(|e| bad_column("status", e))?,
            source: row.source.parse().map_err(|e| bad_column("source", e))?,
            id: row.id,
            symbol: row.symbol,
            exchange_id: row.exchange_id,
            entry_price: row.entry_price,
            entry_time: row.entry_time,
            exit_price: row.exit_price,
            exit_time: row.exit_time,
            pnl_percentage: row.pnl_percentage,
            exit_reason: row.exit_reason,
            quantity: row.quantity,
            mark_price: row.mark_price,
            unrealized_pnl_pct: row.unrealized_pnl_pct,
            metadata: row.metadata,
        })
    }
}

/// Broker connection row in database
#[derive(Debug, Clone, FromRow)]
pub struct BrokerConnectionRow {
    pub id: String,
    pub user_id: String,
    pub broker_type: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub account_ref: Option<String>,
    pub auto_sync_enabled: bool,
    pub is_valid: bool,
}

impl TryFrom<BrokerConnectionRow> for BrokerConnection {
    type Error = PersistenceError;

    fn try_from(row: BrokerConnectionRow) -> Result<Self, Self::Error> {
        Ok(BrokerConnection {
            broker_type: row.broker_type.parse().map_err(|e| bad_column("broker_type", e))?,
            tokens: TokenSet::new(row.access_token, row.refresh_token, row.token_expiry),
            id: row.id,
            user_id: row.user_id,
            account_ref: row.account_ref,
            auto_sync_enabled: row.auto_sync_enabled,
            is_valid: row.is_valid,
        })
    }
}

/// Execution intent row in database
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionIntentRow {
    pub id: String,
    pub symbol: String,
    pub exchange_id: String,
    pub target_side: String,
    pub phase: String,
    pub price_hint: Option<f64>,
    pub reason_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionIntentRow> for ExecutionIntent {
    type Error = PersistenceError;

    fn try_from(row: ExecutionIntentRow) -> Result<Self, Self::Error> {
        Ok(ExecutionIntent {
            target_side: row.target_side.parse().map_err(|e| bad_column("target_side", e))?,
            phase: row.phase.parse().map_err(|e| bad_column("phase", e))?,
            id: row.id,
            symbol: row.symbol,
            exchange_id: row.exchange_id,
            price_hint: row.price_hint,
            reason_tag: row.reason_tag,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Audit log record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLogRecord {
    pub id: i64,
    pub event_type: String,
    pub exchange: String,
    pub symbol: Option<String>,
    pub details: String, // JSON string
    pub timestamp: DateTime<Utc>,
}

/// Reconciliation pass summary in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationAuditRecord {
    pub id: i64,
    pub reconciliation_id: String,
    pub connection_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub updated: i64,
    pub closed: i64,
    pub created: i64,
    pub unchanged: i64,
    pub failed: i64,
    pub failures_json: String,
    pub error: Option<String>,
}
