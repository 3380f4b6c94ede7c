//! Broker Client Trait
//!
//! Read-only position/account access plus the OAuth primitives of a broker.
//! One implementation exists per `BrokerType`; callers pick the variant from a
//! `BrokerClientRegistry` instead of branching on the vendor.

use crate::domain::entities::broker_connection::BrokerType;
use crate::domain::entities::directive::Side;
use crate::domain::errors::UpstreamError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

pub type BrokerResult<T> = Result<T, UpstreamError>;

/// Credentials for one broker call
#[derive(Clone)]
pub struct BrokerSession {
    pub access_token: Zeroizing<String>,
    pub account_ref: Option<String>,
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("access_token", &"<REDACTED>")
            .field("account_ref", &self.account_ref)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    pub avg_entry_price: f64,
    pub qty: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAccount {
    pub equity: f64,
    pub buying_power: f64,
}

/// Result of an authorization-code or refresh-token grant
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Some brokers rotate the refresh token, others keep the old one
    pub refresh_token: Option<String>,
    pub expires_in_seconds: i64,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<REDACTED>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<REDACTED>"))
            .field("expires_in_seconds", &self.expires_in_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerUserInfo {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAccountRef {
    pub account_id: String,
    pub account_type: Option<String>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn broker_type(&self) -> BrokerType;

    async fn list_positions(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerPosition>>;

    async fn get_account(&self, session: &BrokerSession) -> BrokerResult<BrokerAccount>;

    async fn exchange_code_for_token(&self, code: &str, redirect_uri: &str)
        -> BrokerResult<TokenGrant>;

    async fn refresh_token(&self, refresh_token: &str) -> BrokerResult<TokenGrant>;

    async fn get_user_info(&self, session: &BrokerSession) -> BrokerResult<BrokerUserInfo>;

    async fn get_accounts(&self, session: &BrokerSession) -> BrokerResult<Vec<BrokerAccountRef>>;
}

/// Broker clients keyed by vendor
#[derive(Clone, Default)]
pub struct BrokerClientRegistry {
    clients: HashMap<BrokerType, Arc<dyn BrokerClient>>,
}

impl BrokerClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn BrokerClient>) {
        self.clients.insert(client.broker_type(), client);
    }

    pub fn get(&self, broker_type: BrokerType) -> Option<Arc<dyn BrokerClient>> {
        self.clients.get(&broker_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
