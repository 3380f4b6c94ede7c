//! Token refresh single-flight and invalidation

mod common;

use alertdesk::domain::entities::broker_connection::{BrokerConnection, TokenSet};
use alertdesk::domain::entities::directive::Side;
use alertdesk::domain::errors::{AuthError, EngineError, PersistenceError};
use alertdesk::domain::repositories::connection_repository::ConnectionRepository;
use alertdesk::domain::services::token_manager::{TokenManager, TokenManagerConfig};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{broker_position, harness, registry, ScriptedBroker};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delegates to SQLite but can be told to fail token writes
struct FlakyTokenStore {
    inner: Arc<dyn ConnectionRepository>,
    fail_stores: AtomicBool,
}

#[async_trait]
impl ConnectionRepository for FlakyTokenStore {
    async fn get(&self, id: &str) -> Result<Option<BrokerConnection>, PersistenceError> {
        self.inner.get(id).await
    }

    async fn list_auto_sync(&self) -> Result<Vec<BrokerConnection>, PersistenceError> {
        self.inner.list_auto_sync().await
    }

    async fn save(&self, connection: &BrokerConnection) -> Result<(), PersistenceError> {
        self.inner.save(connection).await
    }

    async fn store_tokens(&self, id: &str, tokens: &TokenSet) -> Result<(), PersistenceError> {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(PersistenceError("disk full".to_string()));
        }
        self.inner.store_tokens(id, tokens).await
    }

    async fn mark_invalid(&self, id: &str) -> Result<(), PersistenceError> {
        self.inner.mark_invalid(id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_refresh() {
    let h = harness().await;
    h.add_connection("conn-1", 60).await;
    let broker = ScriptedBroker::with_refresh_delay(Vec::new(), Duration::from_millis(50));
    let tokens = h.token_manager(&broker);

    let calls = (0..10).map(|_| {
        let tokens = tokens.clone();
        tokio::spawn(async move { tokens.fresh_connection("conn-1").await })
    });
    let results = join_all(calls).await;

    assert_eq!(broker.refresh_calls(), 1);
    for result in results {
        let connection = result.unwrap().unwrap();
        assert_eq!(connection.tokens.access_token.as_str(), "access-1");
        assert_eq!(connection.tokens.refresh_token.as_str(), "refresh-1");
    }

    let stored = h.connections.get("conn-1").await.unwrap().unwrap();
    assert_eq!(stored.tokens.access_token.as_str(), "access-1");
    assert!(stored.is_valid);
}

#[tokio::test]
async fn test_fresh_token_is_not_refreshed() {
    let h = harness().await;
    h.add_connection("conn-1", 3600).await;
    let broker = ScriptedBroker::new(Vec::new());
    let tokens = h.token_manager(&broker);

    let connection = tokens.fresh_connection("conn-1").await.unwrap();

    assert_eq!(connection.tokens.access_token.as_str(), "access-0");
    assert_eq!(broker.refresh_calls(), 0);
}

#[tokio::test]
async fn test_failed_refresh_invalidates_connection() {
    let h = harness().await;
    h.add_connection("conn-1", 10).await;
    let broker = ScriptedBroker::new(Vec::new());
    broker.fail_refreshes();
    let tokens = h.token_manager(&broker);

    let first = tokens.fresh_connection("conn-1").await;
    assert!(matches!(
        first,
        Err(EngineError::Auth(AuthError::RefreshFailed { .. }))
    ));

    let stored = h.connections.get("conn-1").await.unwrap().unwrap();
    assert!(!stored.is_valid);

    // Not retried automatically; the user has to re-authenticate
    let second = tokens.fresh_connection("conn-1").await;
    assert!(matches!(
        second,
        Err(EngineError::Auth(AuthError::ReauthenticationRequired(_)))
    ));
    assert_eq!(broker.refresh_calls(), 1);
    assert_eq!(second.unwrap_err().status_code(), 401);
}

#[tokio::test]
async fn test_connections_refresh_independently() {
    let h = harness().await;
    h.add_connection("conn-1", 30).await;
    h.add_connection("conn-2", 30).await;
    let broker = ScriptedBroker::new(Vec::new());
    let tokens = h.token_manager(&broker);

    let (a, b) = tokio::join!(
        tokens.fresh_connection("conn-1"),
        tokens.fresh_connection("conn-2")
    );

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(broker.refresh_calls(), 2);
}

#[tokio::test]
async fn test_reconciliation_refreshes_expiring_token_first() {
    let h = harness().await;
    h.add_connection("conn-1", 5).await;
    let broker = ScriptedBroker::new(vec![broker_position("AAPL", Side::Long, 190.0, 1.0)]);
    let reconciler = h.reconciler(&broker);

    let summary = reconciler.run_reconciliation("conn-1").await.unwrap();

    assert_eq!(broker.refresh_calls(), 1);
    assert_eq!(broker.list_calls(), 1);
    assert_eq!(summary.created, 1);
}

#[tokio::test]
async fn test_unknown_connection_is_auth_error() {
    let h = harness().await;
    let broker = ScriptedBroker::new(Vec::new());
    let tokens = h.token_manager(&broker);

    let result = tokens.fresh_connection("nope").await;
    assert!(matches!(
        result,
        Err(EngineError::Auth(AuthError::ConnectionNotFound(_)))
    ));
}

#[tokio::test]
async fn test_unstored_refresh_is_never_handed_out() {
    let h = harness().await;
    h.add_connection("conn-1", 10).await;
    let broker = ScriptedBroker::new(Vec::new());
    let store = Arc::new(FlakyTokenStore {
        inner: h.connections.clone(),
        fail_stores: AtomicBool::new(true),
    });
    let tokens = TokenManager::new(store.clone(), registry(&broker), TokenManagerConfig::default());

    let first = tokens.fresh_connection("conn-1").await;
    assert!(matches!(first, Err(EngineError::Persistence(_))));

    // Storage still holds the old tokens, so the next call refreshes again
    store.fail_stores.store(false, Ordering::SeqCst);
    let second = tokens.fresh_connection("conn-1").await.unwrap();
    assert_eq!(broker.refresh_calls(), 2);
    assert_eq!(second.tokens.access_token.as_str(), "access-2");

    let stored = h.connections.get("conn-1").await.unwrap().unwrap();
    assert_eq!(stored.tokens.access_token.as_str(), "access-2");
    assert_eq!(stored.tokens.refresh_token.as_str(), "refresh-2");
}

#[tokio::test]
async fn test_reauthenticated_connection_is_picked_up() {
    let h = harness().await;
    let mut connection = h.add_connection("conn-1", 3600).await;
    let broker = ScriptedBroker::new(Vec::new());
    let tokens = h.token_manager(&broker);

    assert_eq!(
        tokens.fresh_connection("conn-1").await.unwrap().tokens.access_token.as_str(),
        "access-0"
    );

    // The OAuth flow stores a new grant directly
    connection.tokens = TokenSet::new(
        "oauth-access".to_string(),
        "oauth-refresh".to_string(),
        Utc::now() + ChronoDuration::seconds(3600),
    );
    h.connections.save(&connection).await.unwrap();

    let current = tokens.fresh_connection("conn-1").await.unwrap();
    assert_eq!(current.tokens.access_token.as_str(), "oauth-access");
    assert_eq!(broker.refresh_calls(), 0);
}
