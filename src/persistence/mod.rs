//! Persistence Layer
//!
//! SQLite storage for the signal ledger, broker connections, reversal intents
//! and audit trails, using async `sqlx`.
//!
//! # Database Schema
//!
//! ## positions
//! One row per opened position. `status` is `open` or `closed`; at most one
//! open row exists per `(symbol, exchange_id)`. Rows are never deleted here.
//!
//! ## broker_connections
//! OAuth token material per broker connection plus the `is_valid` flag cleared
//! when a refresh fails.
//!
//! ## execution_intents
//! Reversal markers (`pending` -> `closed` -> `completed`, or `failed`).
//!
//! ## audit_log
//! Rejected and executed directives, duplicate-row warnings.
//!
//! ## reconciliation_audit
//! One summary row per reconciliation pass.

pub mod models;
pub mod reconciliation_audit;
pub mod repository;

use crate::domain::errors::PersistenceError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

impl From<DatabaseError> for PersistenceError {
    fn from(e: DatabaseError) -> Self {
        PersistenceError(e.to_string())
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Initialize a pool with default settings for `database_url`
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    init_database_with(&DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    })
    .await
}

/// Initialize the database connection pool and run migrations
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    if !config.log_queries {
        options = options.disable_statement_logging();
    }

    // Each connection to `:memory:` is its own database, so keep exactly one alive
    let pool_options = if is_memory_url(&config.url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

async fn execute_migration(pool: &DbPool, what: &str, sql: &str) -> Result<(), DatabaseError> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create {}: {}", what, e)))?;
    Ok(())
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    execute_migration(
        pool,
        "positions table",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            exchange_id TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('long', 'short')),
            status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
            entry_price REAL NOT NULL,
            entry_time DATETIME NOT NULL,
            exit_price REAL,
            exit_time DATETIME,
            pnl_percentage REAL,
            source TEXT NOT NULL CHECK(source IN ('signal', 'manual', 'external')),
            exit_reason TEXT,
            quantity REAL,
            mark_price REAL,
            unrealized_pnl_pct REAL,
            metadata TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "broker_connections table",
        r#"
        CREATE TABLE IF NOT EXISTS broker_connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            broker_type TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            token_expiry DATETIME NOT NULL,
            account_ref TEXT,
            auto_sync_enabled BOOLEAN NOT NULL DEFAULT 1,
            is_valid BOOLEAN NOT NULL DEFAULT 1,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "execution_intents table",
        r#"
        CREATE TABLE IF NOT EXISTS execution_intents (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            exchange_id TEXT NOT NULL,
            target_side TEXT NOT NULL CHECK(target_side IN ('long', 'short')),
            phase TEXT NOT NULL CHECK(phase IN ('pending', 'closed', 'completed', 'failed')),
            price_hint REAL,
            reason_tag TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "audit_log table",
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            exchange TEXT NOT NULL,
            symbol TEXT,
            details TEXT NOT NULL,
            timestamp DATETIME NOT NULL
        )
        "#,
    )
    .await?;

    execute_migration(
        pool,
        "reconciliation_audit table",
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reconciliation_id TEXT NOT NULL UNIQUE,
            connection_id TEXT NOT NULL,
            started_at DATETIME NOT NULL,
            finished_at DATETIME NOT NULL,
            status TEXT NOT NULL,
            updated INTEGER NOT NULL,
            closed INTEGER NOT NULL,
            created INTEGER NOT NULL,
            unchanged INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            failures_json TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .await?;

    for (name, sql) in [
        (
            "positions key index",
            "CREATE INDEX IF NOT EXISTS idx_positions_key ON positions(symbol, exchange_id, status)",
        ),
        (
            "positions exchange index",
            "CREATE INDEX IF NOT EXISTS idx_positions_exchange_status ON positions(exchange_id, status)",
        ),
        (
            "intents phase index",
            "CREATE INDEX IF NOT EXISTS idx_intents_phase ON execution_intents(phase)",
        ),
        (
            "audit timestamp index",
            "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp)",
        ),
        (
            "reconciliation index",
            "CREATE INDEX IF NOT EXISTS idx_reconciliation_connection ON reconciliation_audit(connection_id, finished_at)",
        ),
    ] {
        execute_migration(pool, name, sql).await?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/alertdesk.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/alertdesk.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source
    pub fn from_source<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let url = lookup("DATABASE_URL").unwrap_or(defaults.url);

        let max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let log_queries = lookup("DATABASE_LOG_QUERIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_queries);

        Self {
            url,
            max_connections,
            log_queries,
        }
    }
}
