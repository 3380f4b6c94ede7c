//! Shared doubles and setup for the end-to-end tests
#![allow(dead_code)]

use alertdesk::domain::entities::broker_connection::{BrokerConnection, BrokerType, TokenSet};
use alertdesk::domain::entities::directive::Side;
use alertdesk::domain::entities::exchange::ExchangeConfig;
use alertdesk::domain::errors::UpstreamError;
use alertdesk::domain::repositories::broker_client::{
    BrokerAccount, BrokerAccountRef, BrokerClient, BrokerClientRegistry, BrokerPosition,
    BrokerResult, BrokerSession, BrokerUserInfo, TokenGrant,
};
use alertdesk::domain::repositories::connection_repository::ConnectionRepository;
use alertdesk::domain::repositories::exchange_client::{
    CloseAck, ExchangeClient, ExchangePosition, ExchangeResult, OrderAck, OrderRequest,
};
use alertdesk::domain::services::broker_reconciler::BrokerReconciler;
use alertdesk::domain::services::order_executor::{ExchangeTarget, ExecutorConfig, OrderExecutor};
use alertdesk::domain::services::retry::RetryPolicy;
use alertdesk::domain::services::signal_ledger::SignalLedger;
use alertdesk::domain::services::token_manager::{TokenManager, TokenManagerConfig};
use alertdesk::persistence::repository::{
    AuditLogRepository, SqliteConnectionRepository, SqliteIntentRepository, SqlitePositionRepository,
};
use alertdesk::persistence::{init_database, DbPool};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Exchange double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ExchangeState {
    positions: HashMap<String, Side>,
    calls: Vec<String>,
    /// Set when an order would have held long and short on one symbol
    overlap: bool,
}

/// In-memory venue that records every mutation.
/// It reports no fill or exit prices, so the ledger falls back to the price hint.
pub struct ScriptedExchange {
    name: String,
    equity: f64,
    state: Mutex<ExchangeState>,
}

impl ScriptedExchange {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            equity: 10_000.0,
            state: Mutex::new(ExchangeState::default()),
        })
    }

    /// `place:<SIDE>:<SYMBOL>` and `close:<SYMBOL>` in call order
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn opens(&self) -> usize {
        self.mutations().iter().filter(|c| c.starts_with("place")).count()
    }

    pub fn saw_overlap(&self) -> bool {
        self.state.lock().unwrap().overlap
    }

    pub fn side_of(&self, symbol: &str) -> Side {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Side::Flat)
    }
}

#[async_trait]
impl ExchangeClient for ScriptedExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<ExchangePosition> {
        Ok(match self.side_of(symbol) {
            Side::Flat => ExchangePosition::flat(),
            side => ExchangePosition {
                side,
                size: 1.0,
                entry_price: None,
            },
        })
    }

    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("place:{}:{}", order.side, order.symbol));
        if let Some(held) = state.positions.get(&order.symbol) {
            if *held != order.side {
                state.overlap = true;
            }
        }
        state.positions.insert(order.symbol.clone(), order.side);
        Ok(OrderAck {
            order_id: format!("{}-{}", self.name, state.calls.len()),
            avg_price: None,
        })
    }

    async fn close_position(&self, symbol: &str) -> ExchangeResult<CloseAck> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("close:{}", symbol));
        state.positions.remove(symbol);
        Ok(CloseAck {
            order_id: None,
            exit_price: None,
        })
    }

    async fn get_account_equity(&self) -> ExchangeResult<f64> {
        Ok(self.equity)
    }
}

// ---------------------------------------------------------------------------
// Broker double
// ---------------------------------------------------------------------------

/// Broker reporting a scripted position list.
/// Refreshes are counted and can be slowed down or made to fail.
pub struct ScriptedBroker {
    positions: Mutex<Vec<BrokerPosition>>,
    refresh_calls: AtomicUsize,
    list_calls: AtomicUsize,
    refresh_fails: AtomicBool,
    refresh_delay: Duration,
}

impl ScriptedBroker {
    pub fn new(positions: Vec<BrokerPosition>) -> Arc<Self> {
        Self::with_refresh_delay(positions, Duration::ZERO)
    }

    pub fn with_refresh_delay(positions: Vec<BrokerPosition>, refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            positions: Mutex::new(positions),
            refresh_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            refresh_fails: AtomicBool::new(false),
            refresh_delay,
        })
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock().unwrap() = positions;
    }

    pub fn fail_refreshes(&self) {
        self.refresh_fails.store(true, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    fn broker_type(&self) -> BrokerType {
        BrokerType::Alpaca
    }

    async fn list_positions(&self, _session: &BrokerSession) -> BrokerResult<Vec<BrokerPosition>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_account(&self, _session: &BrokerSession) -> BrokerResult<BrokerAccount> {
        Ok(BrokerAccount {
            equity: 25_000.0,
            buying_power: 50_000.0,
        })
    }

    async fn exchange_code_for_token(&self, _code: &str, _redirect_uri: &str) -> BrokerResult<TokenGrant> {
        Err(UpstreamError::rejected("exchange_code_for_token", "not scripted"))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> BrokerResult<TokenGrant> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(UpstreamError::rejected("refresh_token", "invalid_grant"));
        }
        Ok(TokenGrant {
            access_token: format!("access-{}", call),
            refresh_token: Some(format!("refresh-{}", call)),
            expires_in_seconds: 3600,
        })
    }

    async fn get_user_info(&self, _session: &BrokerSession) -> BrokerResult<BrokerUserInfo> {
        Ok(BrokerUserInfo {
            user_id: "user-1".to_string(),
            email: None,
        })
    }

    async fn get_accounts(&self, _session: &BrokerSession) -> BrokerResult<Vec<BrokerAccountRef>> {
        Ok(vec![BrokerAccountRef {
            account_id: "acct-1".to_string(),
            account_type: None,
        }])
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

pub fn fast_read_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        timeout: Duration::from_secs(2),
    }
}

pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        read_policy: fast_read_policy(),
        mutation_timeout: Duration::from_secs(2),
        mutation_retry_attempts: 1,
        close_confirm_attempts: 2,
        close_confirm_delay: Duration::from_millis(1),
    }
}

/// Ledger, repositories and executor over one in-memory database
pub struct Harness {
    pub pool: DbPool,
    pub ledger: SignalLedger,
    pub audit: Arc<AuditLogRepository>,
    pub connections: Arc<SqliteConnectionRepository>,
    pub executor: Arc<OrderExecutor>,
}

pub async fn harness() -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let audit = Arc::new(AuditLogRepository::new(pool.clone()));
    let ledger = SignalLedger::new(
        Arc::new(SqlitePositionRepository::new(pool.clone())),
        audit.clone(),
    );
    let executor = Arc::new(OrderExecutor::new(
        ledger.clone(),
        Arc::new(SqliteIntentRepository::new(pool.clone())),
        fast_executor_config(),
    ));
    Harness {
        connections: Arc::new(SqliteConnectionRepository::new(pool.clone())),
        pool,
        ledger,
        audit,
        executor,
    }
}

impl Harness {
    pub fn token_manager(&self, broker: &Arc<ScriptedBroker>) -> Arc<TokenManager> {
        Arc::new(TokenManager::new(
            self.connections.clone(),
            registry(broker),
            TokenManagerConfig {
                refresh_margin_seconds: 300,
                refresh_timeout: Duration::from_secs(2),
            },
        ))
    }

    pub fn reconciler(&self, broker: &Arc<ScriptedBroker>) -> Arc<BrokerReconciler> {
        Arc::new(BrokerReconciler::new(
            self.ledger.clone(),
            self.token_manager(broker),
            registry(broker),
            fast_read_policy(),
        ))
    }

    /// Store a valid auto-sync connection whose token expires in `expires_in` seconds
    pub async fn add_connection(&self, id: &str, expires_in: i64) -> BrokerConnection {
        let connection = BrokerConnection {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            broker_type: BrokerType::Alpaca,
            tokens: TokenSet::new(
                "access-0".to_string(),
                "refresh-0".to_string(),
                Utc::now() + ChronoDuration::seconds(expires_in),
            ),
            account_ref: None,
            auto_sync_enabled: true,
            is_valid: true,
        };
        self.connections.save(&connection).await.unwrap();
        connection
    }

    pub async fn row_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM positions")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

pub fn registry(broker: &Arc<ScriptedBroker>) -> BrokerClientRegistry {
    let mut registry = BrokerClientRegistry::new();
    registry.register(broker.clone());
    registry
}

pub fn target(exchange: &Arc<ScriptedExchange>, exchange_id: &str) -> ExchangeTarget {
    ExchangeTarget {
        config: ExchangeConfig::new(exchange_id, 10.0, true).unwrap(),
        client: exchange.clone(),
    }
}

pub fn broker_position(symbol: &str, side: Side, avg_entry_price: f64, qty: f64) -> BrokerPosition {
    BrokerPosition {
        symbol: symbol.to_string(),
        side,
        avg_entry_price,
        qty,
        mark_price: Some(avg_entry_price * 1.01),
        unrealized_pnl_pct: Some(1.0),
        opened_at: None,
    }
}
