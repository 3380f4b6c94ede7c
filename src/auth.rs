use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Bearer API keys accepted on protected routes
///
/// An empty key set disables the gate; `main` warns loudly when that happens.
#[derive(Default)]
pub struct ApiKeyGate {
    keys: Vec<Zeroizing<String>>,
}

impl ApiKeyGate {
    pub fn new(keys: impl IntoIterator<Item = Zeroizing<String>>) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.is_empty()).collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Check if an API key is valid
    fn is_valid_api_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k.as_str() == key)
    }
}

fn unauthorized(details: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "auth_error", "details": details })),
    )
        .into_response()
}

/// Middleware to require authentication for protected endpoints
pub async fn require_auth(
    State(gate): State<Arc<ApiKeyGate>>,
    request: Request,
    next: Next,
) -> Response {
    if !gate.is_enabled() {
        return next.run(request).await;
    }

    // Extract Authorization header
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(auth) if auth.starts_with("Bearer ") => {
            let key = &auth[7..]; // Skip "Bearer "
            if gate.is_valid_api_key(key) {
                next.run(request).await
            } else {
                tracing::warn!("Invalid API key attempted");
                unauthorized("invalid API key")
            }
        }
        Some(_) => {
            tracing::warn!("Invalid Authorization header format (expected Bearer token)");
            unauthorized("expected a Bearer token")
        }
        None => {
            tracing::warn!("Missing Authorization header");
            unauthorized("missing Authorization header")
        }
    }
}
