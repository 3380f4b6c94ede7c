//! Token lifecycle management for broker connections.
//!
//! Access tokens are refreshed proactively when they expire within the
//! configured margin. Refreshes are single-flighted per connection: concurrent
//! callers wait on the connection's lock and then reuse the refreshed tokens.
//! A failed refresh invalidates the connection and surfaces an `AuthError`;
//! it is never retried automatically.
//!
//! Connection state is always read from the repository, so tokens written by
//! the OAuth flow are picked up on the next call. Refreshed tokens are only
//! handed out after they have been stored.

use crate::domain::entities::broker_connection::{BrokerConnection, TokenSet};
use crate::domain::errors::{AuthError, EngineError};
use crate::domain::repositories::broker_client::{BrokerClientRegistry, BrokerSession};
use crate::domain::repositories::connection_repository::ConnectionRepository;
use crate::domain::services::retry::with_timeout;
use crate::domain::services::symbol_locks::KeyedLocks;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    pub refresh_margin_seconds: i64,
    pub refresh_timeout: Duration,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_margin_seconds: 300,
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TokenManager {
    connections: Arc<dyn ConnectionRepository>,
    brokers: BrokerClientRegistry,
    refresh_locks: KeyedLocks,
    config: TokenManagerConfig,
}

impl TokenManager {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        brokers: BrokerClientRegistry,
        config: TokenManagerConfig,
    ) -> Self {
        Self {
            connections,
            brokers,
            refresh_locks: KeyedLocks::new(),
            config,
        }
    }

    async fn load(&self, connection_id: &str) -> Result<BrokerConnection, EngineError> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or_else(|| AuthError::ConnectionNotFound(connection_id.to_string()))?;
        Ok(connection)
    }

    fn needs_refresh(&self, connection: &BrokerConnection) -> bool {
        connection
            .tokens
            .needs_refresh(Utc::now(), self.config.refresh_margin_seconds)
    }

    /// A connection whose access token is valid for at least the refresh margin
    pub async fn fresh_connection(&self, connection_id: &str) -> Result<BrokerConnection, EngineError> {
        let connection = self.load(connection_id).await?;
        if !connection.is_valid {
            return Err(AuthError::ReauthenticationRequired(connection_id.to_string()).into());
        }
        if !self.needs_refresh(&connection) {
            return Ok(connection);
        }

        let _guard = self.refresh_locks.acquire(connection_id).await;

        // Another caller may have refreshed (or failed) while we waited
        let connection = self.load(connection_id).await?;
        if !connection.is_valid {
            return Err(AuthError::ReauthenticationRequired(connection_id.to_string()).into());
        }
        if !self.needs_refresh(&connection) {
            debug!(connection = connection_id, "Token refreshed by concurrent caller");
            return Ok(connection);
        }

        self.refresh(connection).await
    }

    /// Credentials for one broker call
    pub async fn session_for(
        &self,
        connection_id: &str,
    ) -> Result<(BrokerConnection, BrokerSession), EngineError> {
        let connection = self.fresh_connection(connection_id).await?;
        let session = BrokerSession {
            access_token: connection.tokens.access_token.clone(),
            account_ref: connection.account_ref.clone(),
        };
        Ok((connection, session))
    }

    async fn refresh(&self, mut connection: BrokerConnection) -> Result<BrokerConnection, EngineError> {
        let connection_id = connection.id.clone();
        info!(connection = %connection_id, broker = %connection.broker_type, "Refreshing broker access token");

        let client = match self.brokers.get(connection.broker_type) {
            Some(client) => client,
            None => {
                return Err(self
                    .fail(
                        &connection_id,
                        format!("no client configured for {}", connection.broker_type),
                    )
                    .await)
            }
        };

        let refresh_token = connection.tokens.refresh_token.clone();
        let grant = with_timeout(
            "refresh_token",
            self.config.refresh_timeout,
            client.refresh_token(refresh_token.as_str()),
        )
        .await;

        let grant = match grant {
            Ok(grant) => grant,
            Err(e) => return Err(self.fail(&connection_id, e.to_string()).await),
        };

        let tokens = TokenSet::new(
            grant.access_token,
            grant
                .refresh_token
                .unwrap_or_else(|| refresh_token.as_str().to_string()),
            Utc::now() + chrono::Duration::seconds(grant.expires_in_seconds.max(0)),
        );
        if let Err(e) = self.connections.store_tokens(&connection_id, &tokens).await {
            error!(connection = %connection_id, "Refreshed tokens could not be stored: {}", e);
            return Err(e.into());
        }
        connection.tokens = tokens;
        connection.is_valid = true;

        info!(
            connection = %connection_id,
            expires_at = %connection.tokens.expires_at,
            "Broker access token refreshed"
        );
        Ok(connection)
    }

    /// Mark the connection invalid and build the error surfaced to the user
    async fn fail(&self, connection_id: &str, reason: String) -> EngineError {
        error!(connection = connection_id, "Token refresh failed: {}", reason);
        if let Err(e) = self.connections.mark_invalid(connection_id).await {
            warn!(connection = connection_id, "Failed to mark connection invalid: {}", e);
        }
        AuthError::RefreshFailed {
            connection_id: connection_id.to_string(),
            reason,
        }
        .into()
    }
}
