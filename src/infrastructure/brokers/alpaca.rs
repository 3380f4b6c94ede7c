//! Alpaca broker client (trading API v2 + OAuth)

use super::{build_http, get_json, request_token, required, Decimal};
use crate::config::OAuthClientCredentials;
use crate::domain::entities::broker_connection::BrokerType;
use crate::domain::entities::directive::Side;
use crate::domain::errors::UpstreamError;
use crate::domain::repositories::broker_client::{
    BrokerAccount, BrokerAccountRef, BrokerClient, BrokerPosition, BrokerResult, BrokerSession,
    BrokerUserInfo, TokenGrant,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const ALPACA_API_BASE: &str = "https://api.alpaca.markets";
const ALPACA_PAPER_API_BASE: &str = "https://paper-api.alpaca.markets";
const ALPACA_OAUTH_BASE: &str = "https://api.alpaca.markets";

/// Alpaca does not report token lifetimes; assume a day
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct AlpacaEndpoints {
    pub api_base: String,
    pub oauth_base: String,
}

impl AlpacaEndpoints {
    pub fn live() -> Self {
        Self {
            api_base: ALPACA_API_BASE.to_string(),
            oauth_base: ALPACA_OAUTH_BASE.to_string(),
        }
    }

    pub fn paper() -> Self {
        Self {
            api_base: ALPACA_PAPER_API_BASE.to_string(),
            oauth_base: ALPACA_OAUTH_BASE.to_string(),
        }
    }
}

pub struct AlpacaClient {
    http: Client,
    endpoints: AlpacaEndpoints,
    credentials: OAuthClientCredentials,
}

#[derive(Deserialize)]
struct AlpacaPosition {
    symbol: String,
    side: String,
    qty: Decimal,
    avg_entry_price: Decimal,
    current_price: Option<Decimal>,
    /// Fraction, 0.0123 = 1.23%
    unrealized_plpc: Option<Decimal>,
}

#[derive(Deserialize)]
struct AlpacaAccount {
    id: String,
    account_number: Option<String>,
    status: Option<String>,
    equity: Option<Decimal>,
    buying_power: Option<Decimal>,
}

impl AlpacaClient {
    pub fn new(
        credentials: OAuthClientCredentials,
        endpoints: AlpacaEndpoints,
        timeout: Duration,
    ) -> BrokerResult<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            endpoints,
            credentials,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.endpoints.api_base, path.trim_start_matches('/'))
    }

    fn token_url(&self) -> String {
        format!("{}/oauth/token", self.endpoints.oauth_base)
    }

    async fn account(&self, session: &BrokerSession) -> BrokerResult<AlpacaAccount> {
        get_json(&self.http, "get_account", &self.api("/v2/account"), session).await
    }

    fn map_position(position: AlpacaPosition) -> BrokerResult<BrokerPosition> {
        const OP: &str = "list_positions";
        let side = match position.side.to_ascii_lowercase().as_str() {
            "long" => Side::Long,
            "short" => Side::Short,
            other => {
                return Err(UpstreamError::decode(
                    OP,
                    format!("unknown side '{}' for {}", other, position.symbol),
                ))
            }
        };
        Ok(BrokerPosition {
            qty: required(OP, "qty", Some(&position.qty))?.abs(),
            avg_entry_price: required(OP, "avg_entry_price", Some(&position.avg_entry_price))?,
            mark_price: position.current_price.as_ref().and_then(Decimal::value),
            unrealized_pnl_pct: position
                .unrealized_plpc
                .as_ref()
                .and_then(Decimal::value)
                .map(|fraction| fraction * 100.0),
            opened_at: None,
            symbol: position.symbol,
            side,
        })
    }
}

#[async_trait]
impl BrokerClient for AlpacaClient {
    fn broker_type(&self) -> BrokerType {
        BrokerType::Alpaca
    }

    async fn list_positions(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerPosition>> {
        let positions: Vec<AlpacaPosition> =
            get_json(&self.http, "list_positions", &self.api("/v2/positions"), session).await?;
        debug!("Alpaca returned {} positions", positions.len());
        positions.into_iter().map(Self::map_position).collect()
    }

    async fn get_account(&self, session: &BrokerSession) -> BrokerResult<BrokerAccount> {
        let account = self.account(session).await?;
        Ok(BrokerAccount {
            equity: required("get_account", "equity", account.equity.as_ref())?,
            buying_power: required("get_account", "buying_power", account.buying_power.as_ref())?,
        })
    }

    async fn exchange_code_for_token(&self, code: &str, redirect_uri: &str) -> BrokerResult<TokenGrant> {
        request_token(
            &self.http,
            "exchange_code_for_token",
            &self.token_url(),
            &self.credentials,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
            DEFAULT_TOKEN_TTL_SECONDS,
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> BrokerResult<TokenGrant> {
        request_token(
            &self.http,
            "refresh_token",
            &self.token_url(),
            &self.credentials,
            &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
            DEFAULT_TOKEN_TTL_SECONDS,
        )
        .await
    }

    /// Alpaca has no userinfo endpoint; the account id identifies the user
    async fn get_user_info(&self, session: &BrokerSession) -> BrokerResult<BrokerUserInfo> {
        let account = self.account(session).await?;
        Ok(BrokerUserInfo {
            user_id: account.id,
            email: None,
        })
    }

    async fn get_accounts(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerAccountRef>> {
        let account = self.account(session).await?;
        Ok(vec![BrokerAccountRef {
            account_id: account.account_number.unwrap_or(account.id),
            account_type: account.status,
        }])
    }
}
