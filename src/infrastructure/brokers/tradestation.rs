//! TradeStation broker client (brokerage API v3 + OAuth)

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
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const TRADESTATION_API_BASE: &str = "https://api.tradestation.com";
const TRADESTATION_SIM_API_BASE: &str = "https://sim-api.tradestation.com";
const TRADESTATION_SIGNIN_BASE: &str = "https://signin.tradestation.com";

/// TradeStation access tokens live 20 minutes
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 1_200;

#[derive(Debug, Clone)]
pub struct TradeStationEndpoints {
    pub api_base: String,
    pub signin_base: String,
}

impl TradeStationEndpoints {
    pub fn live() -> Self {
        Self {
            api_base: TRADESTATION_API_BASE.to_string(),
            signin_base: TRADESTATION_SIGNIN_BASE.to_string(),
        }
    }

    pub fn sim() -> Self {
        Self {
            api_base: TRADESTATION_SIM_API_BASE.to_string(),
            signin_base: TRADESTATION_SIGNIN_BASE.to_string(),
        }
    }
}

pub struct TradeStationClient {
    http: Client,
    endpoints: TradeStationEndpoints,
    credentials: OAuthClientCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<TsAccount>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TsAccount {
    #[serde(rename = "AccountID")]
    account_id: String,
    account_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<TsPosition>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TsPosition {
    symbol: String,
    long_short: String,
    quantity: Decimal,
    average_price: Decimal,
    last: Option<Decimal>,
    unrealized_profit_loss_percent: Option<Decimal>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BalancesResponse {
    #[serde(default)]
    balances: Vec<TsBalance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TsBalance {
    equity: Option<Decimal>,
    buying_power: Option<Decimal>,
}

#[derive(Deserialize)]
struct UserInfo {
    sub: String,
    email: Option<String>,
}

impl TradeStationClient {
    pub fn new(
        credentials: OAuthClientCredentials,
        endpoints: TradeStationEndpoints,
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
        format!("{}/oauth/token", self.endpoints.signin_base)
    }

    /// Account ids to query: the connection's own account, or every account of the user
    async fn account_ids(&self, session: &BrokerSession) -> BrokerResult<String> {
        if let Some(account) = session.account_ref.as_ref().filter(|a| !a.is_empty()) {
            return Ok(account.clone());
        }
        let accounts = self.get_accounts(session).await?;
        if accounts.is_empty() {
            return Err(UpstreamError::rejected("get_accounts", "no brokerage accounts"));
        }
        Ok(accounts
            .into_iter()
            .map(|a| a.account_id)
            .collect::<Vec<_>>()
            .join(","))
    }

    fn map_position(position: TsPosition) -> BrokerResult<BrokerPosition> {
        const OP: &str = "list_positions";
        let side = match position.long_short.to_ascii_lowercase().as_str() {
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
            qty: required(OP, "Quantity", Some(&position.quantity))?.abs(),
            avg_entry_price: required(OP, "AveragePrice", Some(&position.average_price))?,
            mark_price: position.last.as_ref().and_then(Decimal::value),
            unrealized_pnl_pct: position
                .unrealized_profit_loss_percent
                .as_ref()
                .and_then(Decimal::value),
            opened_at: position.timestamp,
            symbol: position.symbol,
            side,
        })
    }
}

#[async_trait]
impl BrokerClient for TradeStationClient {
    fn broker_type(&self) -> BrokerType {
        BrokerType::TradeStation
    }

    async fn list_positions(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerPosition>> {
        let accounts = self.account_ids(session).await?;
        let url = self.api(&format!("/v3/brokerage/accounts/{}/positions", accounts));
        let response: PositionsResponse = get_json(&self.http, "list_positions", &url, session).await?;
        debug!("TradeStation returned {} positions", response.positions.len());
        response.positions.into_iter().map(Self::map_position).collect()
    }

    /// Sums balances across the queried accounts
    async fn get_account(&self, session: &BrokerSession) -> BrokerResult<BrokerAccount> {
        let accounts = self.account_ids(session).await?;
        let url = self.api(&format!("/v3/brokerage/accounts/{}/balances", accounts));
        let response: BalancesResponse = get_json(&self.http, "get_account", &url, session).await?;
        if response.balances.is_empty() {
            return Err(UpstreamError::decode("get_account", "no balances returned"));
        }

        let mut account = BrokerAccount {
            equity: 0.0,
            buying_power: 0.0,
        };
        for balance in &response.balances {
            account.equity += required("get_account", "Equity", balance.equity.as_ref())?;
            account.buying_power += required("get_account", "BuyingPower", balance.buying_power.as_ref())?;
        }
        Ok(account)
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

    async fn get_user_info(&self, session: &BrokerSession) -> BrokerResult<BrokerUserInfo> {
        let url = format!("{}/userinfo", self.endpoints.signin_base);
        let info: UserInfo = get_json(&self.http, "get_user_info", &url, session).await?;
        Ok(BrokerUserInfo {
            user_id: info.sub,
            email: info.email,
        })
    }

    async fn get_accounts(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerAccountRef>> {
        let url = self.api("/v3/brokerage/accounts");
        let response: AccountsResponse = get_json(&self.http, "get_accounts", &url, session).await?;
        Ok(response
            .accounts
            .into_iter()
            .map(|a| BrokerAccountRef {
                account_id: a.account_id,
                account_type: a.account_type,
            })
            .collect())
    }
}
