//! Reconciliation Audit Repository
//!
//! One row per reconciliation pass, including passes that failed before any
//! position could be compared.

use super::models::ReconciliationAuditRecord;
use super::{DatabaseError, DbPool};
use crate::domain::services::broker_reconciler::ReconciliationSummary;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

pub const STATUS_OK: &str = "OK";
pub const STATUS_PARTIAL: &str = "PARTIAL";
pub const STATUS_FAILED: &str = "FAILED";

/// SQLite store for reconciliation pass summaries
#[derive(Clone)]
pub struct SqliteReconciliationAuditRepository {
    pool: DbPool,
}

impl SqliteReconciliationAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a completed pass. Status is PARTIAL when any symbol failed.
    pub async fn save(&self, summary: &ReconciliationSummary) -> Result<String, DatabaseError> {
        let failures_json = serde_json::to_string(&summary.failures)
            .map_err(|e| DatabaseError::QueryError(format!("Failed to serialize failures: {}", e)))?;
        let status = if summary.failed == 0 { STATUS_OK } else { STATUS_PARTIAL };

        self.insert(
            &summary.connection_id,
            summary.started_at,
            summary.finished_at,
            status,
            [
                summary.updated,
                summary.closed,
                summary.created,
                summary.unchanged,
                summary.failed,
            ],
            &failures_json,
            None,
        )
        .await
    }

    /// Persist a pass that aborted before diffing, e.g. on token refresh failure
    pub async fn save_failure(
        &self,
        connection_id: &str,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<String, DatabaseError> {
        self.insert(
            connection_id,
            started_at,
            Utc::now(),
            STATUS_FAILED,
            [0; 5],
            "[]",
            Some(reason),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        connection_id: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: &str,
        counts: [usize; 5],
        failures_json: &str,
        reason: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let reconciliation_id = format!("rec_{}_{}", connection_id, uuid::Uuid::new_v4().simple());
        let [updated, closed, created, unchanged, failed] = counts;

        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (
                reconciliation_id, connection_id, started_at, finished_at, status,
                updated, closed, created, unchanged, failed, failures_json, error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&reconciliation_id)
        .bind(connection_id)
        .bind(started_at)
        .bind(finished_at)
        .bind(status)
        .bind(updated as i64)
        .bind(closed as i64)
        .bind(created as i64)
        .bind(unchanged as i64)
        .bind(failed as i64)
        .bind(failures_json)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save reconciliation audit: {}", e);
            DatabaseError::QueryError(format!("Failed to save reconciliation audit: {}", e))
        })?;

        debug!("Saved reconciliation audit {} ({})", reconciliation_id, status);
        Ok(reconciliation_id)
    }

    pub async fn last_for(
        &self,
        connection_id: &str,
    ) -> Result<Option<ReconciliationAuditRecord>, DatabaseError> {
        sqlx::query_as::<_, ReconciliationAuditRecord>(
            r#"
            SELECT * FROM reconciliation_audit
            WHERE connection_id = ?1
            ORDER BY started_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get last reconciliation for {}: {}", connection_id, e);
            DatabaseError::QueryError(format!("Failed to get last reconciliation: {}", e))
        })
    }

    /// Passes for a connection within the last `days`, newest first
    pub async fn history(
        &self,
        connection_id: &str,
        days: u32,
    ) -> Result<Vec<ReconciliationAuditRecord>, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);

        sqlx::query_as::<_, ReconciliationAuditRecord>(
            r#"
            SELECT * FROM reconciliation_audit
            WHERE connection_id = ?1 AND started_at >= ?2
            ORDER BY started_at DESC, id DESC
            "#,
        )
        .bind(connection_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get reconciliation history for {}: {}", connection_id, e);
            DatabaseError::QueryError(format!("Failed to get reconciliation history: {}", e))
        })
    }
}
