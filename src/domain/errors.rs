//! Error taxonomy for the directive engine.
//!
//! Each failure family gets its own type so callers can decide how to react:
//! parse/validation errors fail fast with no side effects, auth errors ask the
//! user to re-authenticate, upstream and execution errors carry the raw
//! upstream message so an operator can verify exchange state before retrying.

use std::fmt;
use thiserror::Error;

/// Unrecognised directive text. Carries the raw input for the audit log.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Unrecognized directive ({reason}): {raw}")]
pub struct ParseError {
    pub raw: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Exchange {0} is not configured")]
    UnknownExchange(String),

    #[error("Exchange {0} is inactive")]
    InactiveExchange(String),

    #[error("Value must be finite")]
    MustBeFinite,
}

impl ValidationError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Broker connection {0} not found")]
    ConnectionNotFound(String),

    #[error("Broker connection {0} requires re-authentication")]
    ReauthenticationRequired(String),

    #[error("Token refresh failed for connection {connection_id}: {reason}")]
    RefreshFailed {
        connection_id: String,
        reason: String,
    },
}

/// What went wrong talking to an exchange or broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Timeout,
    Network,
    Rejected,
    Status(u16),
    Decode,
    Unauthorized,
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamErrorKind::Timeout => write!(f, "timeout"),
            UpstreamErrorKind::Network => write!(f, "network"),
            UpstreamErrorKind::Rejected => write!(f, "rejected"),
            UpstreamErrorKind::Status(code) => write!(f, "http {}", code),
            UpstreamErrorKind::Decode => write!(f, "decode"),
            UpstreamErrorKind::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{operation} failed ({kind}): {message}")]
pub struct UpstreamError {
    pub operation: String,
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(operation: &str, kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(operation, UpstreamErrorKind::Timeout, "request timed out")
    }

    pub fn network(operation: &str, message: impl Into<String>) -> Self {
        Self::new(operation, UpstreamErrorKind::Network, message)
    }

    pub fn rejected(operation: &str, message: impl Into<String>) -> Self {
        Self::new(operation, UpstreamErrorKind::Rejected, message)
    }

    pub fn decode(operation: &str, message: impl Into<String>) -> Self {
        Self::new(operation, UpstreamErrorKind::Decode, message)
    }

    /// Transient failures worth another attempt for idempotent reads
    pub fn is_transient(&self) -> bool {
        match self.kind {
            UpstreamErrorKind::Timeout | UpstreamErrorKind::Network => true,
            UpstreamErrorKind::Status(code) => code == 429 || code >= 500,
            UpstreamErrorKind::Rejected
            | UpstreamErrorKind::Decode
            | UpstreamErrorKind::Unauthorized => false,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        let operation = e
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "request".to_string());
        if e.is_timeout() {
            UpstreamError::timeout(&operation)
        } else if e.is_decode() {
            UpstreamError::decode(&operation, e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::new(&operation, UpstreamErrorKind::Status(status.as_u16()), e.to_string())
        } else {
            UpstreamError::network(&operation, e.to_string())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Database error: {0}")]
pub struct PersistenceError(pub String);

impl From<sqlx::Error> for PersistenceError {
    fn from(e: sqlx::Error) -> Self {
        PersistenceError(e.to_string())
    }
}

/// A multi-step action plan aborted mid-sequence.
///
/// `completed` lists the steps that were confirmed on the exchange before the
/// failure, so the caller knows which state to verify before retrying.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("{step} on {exchange} for {symbol} failed after [{}]: {source}", .completed.join(", "))]
    StepFailed {
        symbol: String,
        exchange: String,
        step: String,
        completed: Vec<String>,
        #[source]
        source: UpstreamError,
    },

    #[error("Close of {symbol} on {exchange} could not be confirmed; open step skipped")]
    CloseUnconfirmed { symbol: String, exchange: String },

    #[error("No fill price available for {symbol} on {exchange}; verify exchange state")]
    MissingFillPrice { symbol: String, exchange: String },

    #[error("Order for {symbol} on {exchange} filled but ledger write failed: {reason}")]
    LedgerWriteFailed {
        symbol: String,
        exchange: String,
        reason: String,
    },

    #[error("Invalid order size for {symbol}: {reason}")]
    InvalidSize { symbol: String, reason: String },
}

/// Failure isolated to one position during a reconciliation pass
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize)]
#[error("Reconciliation of {symbol} failed: {reason}")]
pub struct ReconciliationError {
    pub symbol: String,
    pub reason: String,
}

/// Top-level error returned by the engine's entry points
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    /// HTTP status the inbound endpoints answer with
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Parse(_) | EngineError::Validation(_) => 400,
            EngineError::Auth(_) => 401,
            EngineError::Upstream(_)
            | EngineError::Execution(_)
            | EngineError::Persistence(_) => 500,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Parse(_) => "parse_error",
            EngineError::Validation(_) => "validation_error",
            EngineError::Auth(_) => "auth_error",
            EngineError::Upstream(_) => "upstream_error",
            EngineError::Execution(_) => "execution_error",
            EngineError::Persistence(_) => "persistence_error",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Persistence(e.into())
    }
}
