use alertdesk::application::actors::reconciliation_actor::ReconciliationActor;
use alertdesk::application::http::{build_router, AppState};
use alertdesk::application::services::directive_service::DirectiveService;
use alertdesk::auth::ApiKeyGate;
use alertdesk::config::AppConfig;
use alertdesk::domain::services::broker_reconciler::BrokerReconciler;
use alertdesk::domain::services::order_executor::OrderExecutor;
use alertdesk::domain::services::signal_ledger::SignalLedger;
use alertdesk::domain::services::token_manager::TokenManager;
use alertdesk::infrastructure::exchange_client_factory::{BrokerClientFactory, ExchangeClientFactory};
use alertdesk::persistence::init_database_with;
use alertdesk::persistence::reconciliation_audit::SqliteReconciliationAuditRepository;
use alertdesk::persistence::repository::{
    AuditLogRepository, SqliteConnectionRepository, SqliteIntentRepository, SqlitePositionRepository,
};
use alertdesk::rate_limit::WebhookThrottle;
use alertdesk::task_runner::{run_periodic, PeriodicTaskConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on one reconciliation pass before it is recorded as failed
const RECONCILIATION_PASS_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alertdesk=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("alertdesk starting...");

    let config = AppConfig::from_env();
    info!("Configuration loaded: {:?}", config);

    let pool = init_database_with(&config.database).await?;
    let positions = Arc::new(SqlitePositionRepository::new(pool.clone()));
    let connections = Arc::new(SqliteConnectionRepository::new(pool.clone()));
    let intents = Arc::new(SqliteIntentRepository::new(pool.clone()));
    let audit = Arc::new(AuditLogRepository::new(pool.clone()));
    let reconciliation_audit = SqliteReconciliationAuditRepository::new(pool.clone());

    let ledger = SignalLedger::new(positions, audit.clone());

    let targets = ExchangeClientFactory::create_all(&config);
    if targets.is_empty() {
        warn!("No active exchange clients; directives will not place orders");
    }
    let brokers = BrokerClientFactory::create_all(&config);

    let executor = Arc::new(OrderExecutor::new(
        ledger.clone(),
        intents,
        config.executor_config(),
    ));
    match executor.resume_pending_intents(&targets).await {
        Ok(0) => {}
        Ok(count) => info!("✓ Resumed {} unfinished reversal(s)", count),
        Err(e) => error!("✗ Failed to resume unfinished reversals: {}", e),
    }

    let tokens = Arc::new(TokenManager::new(
        connections.clone(),
        brokers.clone(),
        config.token_manager_config(),
    ));
    let reconciler = Arc::new(BrokerReconciler::new(
        ledger,
        tokens,
        brokers,
        config.read_policy(),
    ));
    let reconciliation = ReconciliationActor::new(
        reconciler,
        connections,
        Some(reconciliation_audit),
        RECONCILIATION_PASS_TIMEOUT,
    )
    .spawn();

    let directives = Arc::new(DirectiveService::new(
        executor,
        targets.values().cloned(),
        audit,
        config.dedupe_cache_size,
    ));

    let gate = Arc::new(ApiKeyGate::new(config.api_keys.clone()));
    if !gate.is_enabled() {
        warn!("No API keys configured; webhook authentication is DISABLED");
    } else {
        info!("API key gate enabled with {} key(s)", gate.key_count());
    }
    let throttle = WebhookThrottle::per_minute(config.webhook_rate_limit_per_minute);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if config.reconciliation_enabled {
        let handle = reconciliation.clone();
        let task_config =
            PeriodicTaskConfig::every(Duration::from_secs(config.reconciliation_interval_seconds));
        Some(tokio::spawn(async move {
            run_periodic("broker_reconciliation", task_config, shutdown_rx, || {
                let handle = handle.clone();
                async move {
                    let outcomes = match handle.reconcile_all().await {
                        Ok(outcomes) => outcomes,
                        Err(e) => return Err(e.to_string()),
                    };
                    let failed: Vec<String> = outcomes
                        .iter()
                        .filter_map(|o| {
                            o.result
                                .as_ref()
                                .err()
                                .map(|reason| format!("{}: {}", o.connection_id, reason))
                        })
                        .collect();
                    if failed.is_empty() {
                        Ok(())
                    } else {
                        Err(failed.join("; "))
                    }
                }
            })
            .await;
        }))
    } else {
        info!("Periodic broker reconciliation disabled");
        None
    };

    let app = build_router(AppState {
        directives,
        reconciliation: reconciliation.clone(),
        gate,
        throttle,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("✓ Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.await {
            warn!("Reconciliation scheduler ended abnormally: {}", e);
        }
    }
    reconciliation.shutdown().await;

    info!("alertdesk stopped");
    Ok(())
}
