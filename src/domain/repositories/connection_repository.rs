use crate::domain::entities::broker_connection::{BrokerConnection, TokenSet};
use crate::domain::errors::PersistenceError;
use async_trait::async_trait;

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<BrokerConnection>, PersistenceError>;

    /// Valid connections with auto-sync turned on
    async fn list_auto_sync(&self) -> Result<Vec<BrokerConnection>, PersistenceError>;

    /// Insert or replace a connection produced by the OAuth flow
    async fn save(&self, connection: &BrokerConnection) -> Result<(), PersistenceError>;

    /// Replace access token, refresh token and expiry in a single write
    async fn store_tokens(&self, id: &str, tokens: &TokenSet) -> Result<(), PersistenceError>;

    async fn mark_invalid(&self, id: &str) -> Result<(), PersistenceError>;
}
