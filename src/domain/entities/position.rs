use super::directive::Side;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

pub const EXIT_REASON_CLOSED_EXTERNALLY: &str = "closed_externally";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(format!("unknown position status '{}'", other)),
        }
    }
}

/// Who created a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSource {
    Signal,
    Manual,
    External,
}

impl PositionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSource::Signal => "signal",
            PositionSource::Manual => "manual",
            PositionSource::External => "external",
        }
    }
}

impl fmt::Display for PositionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PositionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(PositionSource::Signal),
            "manual" => Ok(PositionSource::Manual),
            "external" => Ok(PositionSource::External),
            other => Err(format!("unknown position source '{}'", other)),
        }
    }
}

/// One ledger row. At most one row per `(symbol, exchange_id)` is open.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRecord {
    pub id: String,
    pub symbol: String,
    pub exchange_id: String,
    /// Always `Long` or `Short`
    pub side: Side,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub pnl_percentage: Option<f64>,
    pub source: PositionSource,
    pub exit_reason: Option<String>,
    pub quantity: Option<f64>,
    pub mark_price: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub metadata: Option<String>,
}

impl PositionRecord {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Fields needed to open a ledger row
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub symbol: String,
    pub exchange_id: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub source: PositionSource,
    pub quantity: Option<f64>,
    pub mark_price: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub metadata: Option<String>,
}

impl NewPosition {
    pub fn new(
        symbol: impl Into<String>,
        exchange_id: impl Into<String>,
        side: Side,
        entry_price: f64,
        entry_time: DateTime<Utc>,
        source: PositionSource,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            exchange_id: exchange_id.into(),
            side,
            entry_price,
            entry_time,
            source,
            quantity: None,
            mark_price: None,
            unrealized_pnl_pct: None,
            metadata: None,
        }
    }
}

/// Fields written when a row is closed
#[derive(Debug, Clone)]
pub struct PositionClose {
    pub exit_price: Option<f64>,
    pub exit_time: DateTime<Utc>,
    pub pnl_percentage: Option<f64>,
    pub exit_reason: String,
}

/// Mutable fields refreshed from a broker snapshot while the row stays open
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub quantity: Option<f64>,
    pub mark_price: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
    pub metadata: Option<String>,
}

impl PositionSnapshot {
    /// True when writing this snapshot would change the row
    pub fn differs_from(&self, record: &PositionRecord) -> bool {
        !approx_eq(self.quantity, record.quantity)
            || !approx_eq(self.mark_price, record.mark_price)
            || !approx_eq(self.unrealized_pnl_pct, record.unrealized_pnl_pct)
            || self.metadata != record.metadata
    }
}

fn approx_eq(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1.0),
        (None, None) => true,
        _ => false,
    }
}
