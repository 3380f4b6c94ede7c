use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exposure held (or wanted) on one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Flat,
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Flat => "FLAT",
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    /// Lowercase form stored in the ledger
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Side::Flat => "flat",
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Flat => Side::Flat,
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, Side::Flat)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(Side::Flat),
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// Canonical trade intent produced by the directive parser.
///
/// Never persisted as-is; `raw_source` is kept so rejected or executed
/// directives can be audited with the text that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeDirective {
    pub symbol: String,
    pub desired_side: Side,
    pub price_hint: Option<f64>,
    pub reason_tag: Option<String>,
    pub raw_source: String,
    /// Bar close time supplied by the sender, used as a dedupe key
    pub bar_time: Option<String>,
}

impl TradeDirective {
    pub fn new(symbol: impl Into<String>, desired_side: Side, raw_source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            desired_side,
            price_hint: None,
            reason_tag: None,
            raw_source: raw_source.into(),
            bar_time: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price_hint = Some(price);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason_tag = Some(reason.into());
        self
    }

    pub fn with_bar_time(mut self, bar_time: impl Into<String>) -> Self {
        self.bar_time = Some(bar_time.into());
        self
    }
}
