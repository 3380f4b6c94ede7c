use super::directive::Side;
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Progress of a persisted reversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentPhase {
    /// Recorded, CLOSE not yet confirmed
    Pending,
    /// CLOSE confirmed, OPEN outstanding
    Closed,
    Completed,
    /// Plan aborted and the error was surfaced; not resumed
    Failed,
}

impl IntentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentPhase::Pending => "pending",
            IntentPhase::Closed => "closed",
            IntentPhase::Completed => "completed",
            IntentPhase::Failed => "failed",
        }
    }
}

impl FromStr for IntentPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentPhase::Pending),
            "closed" => Ok(IntentPhase::Closed),
            "completed" => Ok(IntentPhase::Completed),
            "failed" => Ok(IntentPhase::Failed),
            other => Err(format!("unknown intent phase '{}'", other)),
        }
    }
}

/// Marker written before the CLOSE leg of a reversal so a crash between
/// CLOSE and OPEN can be resumed on restart.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionIntent {
    pub id: String,
    pub symbol: String,
    pub exchange_id: String,
    pub target_side: Side,
    pub phase: IntentPhase,
    pub price_hint: Option<f64>,
    pub reason_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionIntent {
    pub fn reversal(
        symbol: &str,
        exchange_id: &str,
        target_side: Side,
        price_hint: Option<f64>,
        reason_tag: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            exchange_id: exchange_id.to_string(),
            target_side,
            phase: IntentPhase::Pending,
            price_hint,
            reason_tag,
            created_at: now,
            updated_at: now,
        }
    }
}
