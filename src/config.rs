//! Application configuration loaded from the environment.

use crate::domain::entities::exchange::ExchangeConfig;
use crate::domain::services::order_executor::ExecutorConfig;
use crate::domain::services::retry::RetryPolicy;
use crate::domain::services::token_manager::TokenManagerConfig;
use crate::persistence::DatabaseConfig;
use crate::rate_limit::DEFAULT_DIRECTIVES_PER_MINUTE;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

pub const MIN_API_KEY_LENGTH: usize = 32;

/// OAuth client credentials for one broker
#[derive(Clone)]
pub struct OAuthClientCredentials {
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
}

impl fmt::Debug for OAuthClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<REDACTED>")
            .finish()
    }
}

#[derive(Clone)]
pub struct BybitCredentials {
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    pub testnet: bool,
}

impl fmt::Debug for BybitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BybitCredentials")
            .field("api_key", &"<REDACTED>")
            .field("api_secret", &"<REDACTED>")
            .field("testnet", &self.testnet)
            .finish()
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Bearer keys accepted by the webhook gate; empty disables the gate
    pub api_keys: Vec<Zeroizing<String>>,
    pub webhook_rate_limit_per_minute: u32,
    pub database: DatabaseConfig,
    pub exchanges: Vec<ExchangeConfig>,
    pub bybit: Option<BybitCredentials>,
    pub alpaca: Option<OAuthClientCredentials>,
    pub tradestation: Option<OAuthClientCredentials>,

    pub upstream_timeout_ms: u64,
    pub read_retry_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub close_confirm_attempts: u32,
    pub close_confirm_delay_ms: u64,
    pub mutation_retry_attempts: u32,
    pub dedupe_cache_size: usize,

    pub token_refresh_margin_seconds: i64,

    pub reconciliation_enabled: bool,
    pub reconciliation_interval_seconds: u64,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_keys", &format!("<{} REDACTED>", self.api_keys.len()))
            .field("webhook_rate_limit_per_minute", &self.webhook_rate_limit_per_minute)
            .field("database", &self.database)
            .field("exchanges", &self.exchanges)
            .field("bybit", &self.bybit)
            .field("alpaca", &self.alpaca)
            .field("tradestation", &self.tradestation)
            .field("upstream_timeout_ms", &self.upstream_timeout_ms)
            .field("reconciliation_enabled", &self.reconciliation_enabled)
            .field("reconciliation_interval_seconds", &self.reconciliation_interval_seconds)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind_addr: "127.0.0.1:3000".to_string(),
            api_keys: Vec::new(),
            webhook_rate_limit_per_minute: DEFAULT_DIRECTIVES_PER_MINUTE,
            database: DatabaseConfig::default(),
            exchanges: vec![ExchangeConfig {
                exchange_id: "paper".to_string(),
                position_sizing_percentage: 10.0,
                is_active: true,
            }],
            bybit: None,
            alpaca: None,
            tradestation: None,

            upstream_timeout_ms: 10_000,
            read_retry_attempts: 3,
            read_retry_delay_ms: 250,
            close_confirm_attempts: 5,
            close_confirm_delay_ms: 500,
            mutation_retry_attempts: 1,
            dedupe_cache_size: 1024,

            token_refresh_margin_seconds: 300,

            reconciliation_enabled: true,
            reconciliation_interval_seconds: 300, // Every 5 minutes
        }
    }
}

/// Parse a numeric variable, keeping `current` (with a warning) when invalid or out of range
fn parse_in_range<T>(name: &str, raw: Option<String>, current: T, valid: impl Fn(&T) -> bool) -> T
where
    T: FromStr + fmt::Display + Copy,
    T::Err: fmt::Display,
{
    let Some(raw) = raw else {
        return current;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            tracing::warn!("Invalid {} value: {}, using default: {}", name, value, current);
            current
        }
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default: {}", name, raw, e, current);
            current
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    raw.to_lowercase() == "true" || raw == "1"
}

/// Parse `EXCHANGES`: comma separated `id:percentage[:inactive]`
pub fn parse_exchanges(raw: &str) -> Result<Vec<ExchangeConfig>, String> {
    let mut exchanges: Vec<ExchangeConfig> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let (id, percentage, active) = match parts.as_slice() {
            [id, pct] => (*id, *pct, true),
            [id, pct, flag] if flag.eq_ignore_ascii_case("inactive") => (*id, *pct, false),
            [id, pct, flag] if flag.eq_ignore_ascii_case("active") => (*id, *pct, true),
            _ => return Err(format!("malformed exchange entry '{}'", entry)),
        };
        let percentage = percentage
            .parse::<f64>()
            .map_err(|e| format!("bad percentage in '{}': {}", entry, e))?;
        let config = ExchangeConfig::new(id.to_lowercase(), percentage, active)
            .map_err(|e| format!("invalid exchange '{}': {}", entry, e))?;
        if exchanges.iter().any(|x| x.exchange_id == config.exchange_id) {
            return Err(format!("exchange '{}' listed twice", config.exchange_id));
        }
        exchanges.push(config);
    }
    if exchanges.is_empty() {
        return Err("no exchanges configured".to_string());
    }
    Ok(exchanges)
}

fn oauth_credentials<F>(lookup: &F, prefix: &str) -> Option<OAuthClientCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    let client_id = lookup(&format!("{}_CLIENT_ID", prefix)).filter(|s| !s.trim().is_empty())?;
    let client_secret = lookup(&format!("{}_CLIENT_SECRET", prefix)).filter(|s| !s.trim().is_empty())?;
    Some(OAuthClientCredentials {
        client_id,
        client_secret: Zeroizing::new(client_secret),
    })
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppConfig {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source, falling back to defaults
    pub fn from_source<F>(lookup: F) -> AppConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig {
            database: DatabaseConfig::from_source(&lookup),
            ..AppConfig::default()
        };

        if let Some(addr) = lookup("BIND_ADDR").filter(|s| !s.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }

        if let Some(keys) = lookup("API_KEYS") {
            for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                if key.len() < MIN_API_KEY_LENGTH {
                    tracing::warn!(
                        "Ignoring API key shorter than {} characters",
                        MIN_API_KEY_LENGTH
                    );
                    continue;
                }
                config.api_keys.push(Zeroizing::new(key.to_string()));
            }
        }

        config.webhook_rate_limit_per_minute = parse_in_range(
            "WEBHOOK_RATE_LIMIT_PER_MINUTE",
            lookup("WEBHOOK_RATE_LIMIT_PER_MINUTE"),
            config.webhook_rate_limit_per_minute,
            |v| *v > 0,
        );

        if let Some(raw) = lookup("EXCHANGES") {
            match parse_exchanges(&raw) {
                Ok(exchanges) => config.exchanges = exchanges,
                Err(e) => tracing::warn!("Invalid EXCHANGES '{}': {}, using default", raw, e),
            }
        }

        if let (Some(api_key), Some(api_secret)) = (
            lookup("BYBIT_API_KEY").filter(|s| !s.trim().is_empty()),
            lookup("BYBIT_API_SECRET").filter(|s| !s.trim().is_empty()),
        ) {
            config.bybit = Some(BybitCredentials {
                api_key,
                api_secret: Zeroizing::new(api_secret),
                testnet: lookup("BYBIT_TESTNET").map(|v| parse_bool(&v)).unwrap_or(false),
            });
        }
        config.alpaca = oauth_credentials(&lookup, "ALPACA");
        config.tradestation = oauth_credentials(&lookup, "TRADESTATION");

        config.upstream_timeout_ms = parse_in_range(
            "UPSTREAM_TIMEOUT_MS",
            lookup("UPSTREAM_TIMEOUT_MS"),
            config.upstream_timeout_ms,
            |v| (100..=120_000).contains(v),
        );
        config.read_retry_attempts = parse_in_range(
            "READ_RETRY_ATTEMPTS",
            lookup("READ_RETRY_ATTEMPTS"),
            config.read_retry_attempts,
            |v| (1..=10).contains(v),
        );
        config.read_retry_delay_ms = parse_in_range(
            "READ_RETRY_DELAY_MS",
            lookup("READ_RETRY_DELAY_MS"),
            config.read_retry_delay_ms,
            |v| *v <= 60_000,
        );
        config.close_confirm_attempts = parse_in_range(
            "CLOSE_CONFIRM_ATTEMPTS",
            lookup("CLOSE_CONFIRM_ATTEMPTS"),
            config.close_confirm_attempts,
            |v| (1..=50).contains(v),
        );
        config.close_confirm_delay_ms = parse_in_range(
            "CLOSE_CONFIRM_DELAY_MS",
            lookup("CLOSE_CONFIRM_DELAY_MS"),
            config.close_confirm_delay_ms,
            |v| *v <= 60_000,
        );
        config.mutation_retry_attempts = parse_in_range(
            "MUTATION_RETRY_ATTEMPTS",
            lookup("MUTATION_RETRY_ATTEMPTS"),
            config.mutation_retry_attempts,
            |v| *v <= 3,
        );
        config.dedupe_cache_size = parse_in_range(
            "DEDUPE_CACHE_SIZE",
            lookup("DEDUPE_CACHE_SIZE"),
            config.dedupe_cache_size,
            |v| *v > 0,
        );
        config.token_refresh_margin_seconds = parse_in_range(
            "TOKEN_REFRESH_MARGIN_SECONDS",
            lookup("TOKEN_REFRESH_MARGIN_SECONDS"),
            config.token_refresh_margin_seconds,
            |v| (0..=86_400).contains(v),
        );

        if let Some(enabled) = lookup("RECONCILIATION_ENABLED") {
            config.reconciliation_enabled = parse_bool(&enabled);
        }
        config.reconciliation_interval_seconds = parse_in_range(
            "RECONCILIATION_INTERVAL_SECONDS",
            lookup("RECONCILIATION_INTERVAL_SECONDS"),
            config.reconciliation_interval_seconds,
            |v| (30..=3600).contains(v),
        );

        config
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn read_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.read_retry_attempts,
            base_delay: Duration::from_millis(self.read_retry_delay_ms),
            max_delay: Duration::from_millis(self.read_retry_delay_ms.saturating_mul(16).max(1)),
            timeout: self.upstream_timeout(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            read_policy: self.read_policy(),
            mutation_timeout: self.upstream_timeout(),
            mutation_retry_attempts: self.mutation_retry_attempts,
            close_confirm_attempts: self.close_confirm_attempts,
            close_confirm_delay: Duration::from_millis(self.close_confirm_delay_ms),
        }
    }

    pub fn token_manager_config(&self) -> TokenManagerConfig {
        TokenManagerConfig {
            refresh_margin_seconds: self.token_refresh_margin_seconds,
            refresh_timeout: self.upstream_timeout(),
        }
    }

    pub fn active_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.is_active)
    }
}
