use crate::domain::errors::PersistenceError;
use async_trait::async_trait;

pub const EVENT_DIRECTIVE_REJECTED: &str = "directive_rejected";
pub const EVENT_DIRECTIVE_EXECUTED: &str = "directive_executed";
pub const EVENT_DIRECTIVE_FAILED: &str = "directive_failed";
pub const EVENT_DUPLICATE_OPEN_ROWS: &str = "duplicate_open_rows";

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub event_type: String,
    pub exchange: String,
    pub symbol: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: &str, exchange: &str, details: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            exchange: exchange.to_string(),
            symbol: None,
            details,
        }
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), PersistenceError>;
}
