//! Authenticated broker connections and their OAuth token material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Broker vendor behind a connection; selects the `BrokerClient` variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    Alpaca,
    TradeStation,
}

impl BrokerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerType::Alpaca => "alpaca",
            BrokerType::TradeStation => "tradestation",
        }
    }
}

impl fmt::Display for BrokerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alpaca" => Ok(BrokerType::Alpaca),
            "tradestation" => Ok(BrokerType::TradeStation),
            other => Err(format!("unknown broker type '{}'", other)),
        }
    }
}

/// Access/refresh token pair with its expiry
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: Zeroizing<String>,
    pub refresh_token: Zeroizing<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    pub fn new(access_token: String, refresh_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: Zeroizing::new(access_token),
            refresh_token: Zeroizing::new(refresh_token),
            expires_at,
        }
    }

    /// Whether the access token expires within `margin_seconds` of `now`
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin_seconds: i64) -> bool {
        now + chrono::Duration::seconds(margin_seconds) >= self.expires_at
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<REDACTED>")
            .field("refresh_token", &"<REDACTED>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConnection {
    pub id: String,
    pub user_id: String,
    pub broker_type: BrokerType,
    pub tokens: TokenSet,
    pub account_ref: Option<String>,
    pub auto_sync_enabled: bool,
    /// Cleared when a refresh fails; the user must re-authenticate
    pub is_valid: bool,
}
