//! Broker REST clients
//!
//! Both brokers speak JSON over HTTPS with a Bearer access token and issue
//! tokens from a standard OAuth2 token endpoint. The shared plumbing lives
//! here; vendor modules only map payloads.

pub mod alpaca;
pub mod tradestation;

use crate::config::OAuthClientCredentials;
use crate::domain::errors::{UpstreamError, UpstreamErrorKind};
use crate::domain::repositories::broker_client::{BrokerResult, BrokerSession, TokenGrant};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

pub use alpaca::AlpacaClient;
pub use tradestation::TradeStationClient;

pub(crate) fn build_http(timeout: Duration) -> BrokerResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(timeout)
        .build()
        .map_err(|e| UpstreamError::network("http_client", e.to_string()))
}

/// Map non-2xx responses to an `UpstreamError`, keeping the body for operators
async fn check_status(operation: &str, response: Response) -> BrokerResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = if status.as_u16() == 401 || status.as_u16() == 403 {
        UpstreamErrorKind::Unauthorized
    } else {
        UpstreamErrorKind::Status(status.as_u16())
    };
    Err(UpstreamError::new(operation, kind, body))
}

async fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> BrokerResult<T> {
    let response = check_status(operation, response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| UpstreamError::decode(operation, e.to_string()))
}

/// Authenticated GET returning JSON
pub(crate) async fn get_json<T: DeserializeOwned>(
    http: &Client,
    operation: &str,
    url: &str,
    session: &BrokerSession,
) -> BrokerResult<T> {
    let response = http
        .get(url)
        .bearer_auth(session.access_token.as_str())
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| with_operation(operation, e.into()))?;
    decode(operation, response).await
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// POST an OAuth2 grant to `token_url`. Client credentials travel in the form body.
pub(crate) async fn request_token(
    http: &Client,
    operation: &str,
    token_url: &str,
    credentials: &OAuthClientCredentials,
    grant: &[(&str, &str)],
    default_expires_in: i64,
) -> BrokerResult<TokenGrant> {
    let mut form: Vec<(&str, &str)> = grant.to_vec();
    form.push(("client_id", credentials.client_id.as_str()));
    form.push(("client_secret", credentials.client_secret.as_str()));

    let response = http
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| with_operation(operation, e.into()))?;
    let token: TokenResponse = decode(operation, response).await?;

    if token.access_token.is_empty() {
        return Err(UpstreamError::decode(operation, "token response without access_token"));
    }
    Ok(TokenGrant {
        access_token: token.access_token,
        refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        expires_in_seconds: token.expires_in.unwrap_or(default_expires_in),
    })
}

fn with_operation(operation: &str, mut error: UpstreamError) -> UpstreamError {
    error.operation = operation.to_string();
    error
}

/// Brokers send decimals as strings; some send plain numbers
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Decimal {
    Text(String),
    Number(f64),
}

impl Decimal {
    pub fn value(&self) -> Option<f64> {
        let parsed = match self {
            Decimal::Text(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            Decimal::Number(n) => Some(*n),
        };
        parsed.filter(|v| v.is_finite())
    }
}

pub(crate) fn required(operation: &str, field: &str, value: Option<&Decimal>) -> BrokerResult<f64> {
    value
        .and_then(Decimal::value)
        .ok_or_else(|| UpstreamError::decode(operation, format!("missing or invalid {}", field)))
}
