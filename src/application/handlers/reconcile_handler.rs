use axum::{
    extract::{Path, State},
    Json,
};

use crate::application::http::AppState;
use crate::domain::errors::{EngineError, ValidationError};
use crate::domain::services::broker_reconciler::ReconciliationSummary;

/// Run one reconciliation pass for a broker connection
pub async fn post_reconcile(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Json<ReconciliationSummary>, EngineError> {
    let connection_id = connection_id.trim();
    if connection_id.is_empty() {
        return Err(ValidationError::MissingField("connection_id".to_string()).into());
    }
    let summary = state.reconciliation.reconcile(connection_id).await?;
    Ok(Json(summary))
}
