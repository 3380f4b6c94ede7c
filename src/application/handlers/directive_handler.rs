use axum::{body::Bytes, extract::State, Json};

use crate::application::http::AppState;
use crate::application::services::directive_service::DirectiveResponse;
use crate::domain::errors::EngineError;

/// Accept a trade directive (`{alertText}` or `{symbol, action, ...}`)
pub async fn post_directive(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DirectiveResponse>, EngineError> {
    let response = state.directives.handle_body(&body).await?;
    Ok(Json(response))
}
