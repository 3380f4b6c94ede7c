//! HTTP surface
//!
//! - `POST /webhook/directive` (API-key gate, rate limited)
//! - `POST /reconcile/:connection_id` (API-key gate)
//! - `GET /health`

use crate::application::actors::reconciliation_actor::ReconciliationHandle;
use crate::application::handlers::directive_handler::post_directive;
use crate::application::handlers::reconcile_handler::post_reconcile;
use crate::application::services::directive_service::DirectiveService;
use crate::auth::{require_auth, ApiKeyGate};
use crate::domain::errors::EngineError;
use crate::rate_limit::{throttle_webhook, WebhookThrottle};
use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub directives: Arc<DirectiveService>,
    pub reconciliation: ReconciliationHandle,
    pub gate: Arc<ApiKeyGate>,
    pub throttle: Arc<WebhookThrottle>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(kind = self.label(), "Request failed: {}", self);
        } else {
            warn!(kind = self.label(), "Request rejected: {}", self);
        }
        (
            status,
            Json(json!({
                "error": self.label(),
                "details": self.to_string(),
            })),
        )
            .into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn build_router(state: AppState) -> Router {
    let webhook = Router::new()
        .route("/webhook/directive", post(post_directive))
        .route_layer(middleware::from_fn_with_state(
            state.throttle.clone(),
            throttle_webhook,
        ));

    let protected = Router::new()
        .merge(webhook)
        .route("/reconcile/:connection_id", post(post_reconcile))
        .route_layer(middleware::from_fn_with_state(state.gate.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
