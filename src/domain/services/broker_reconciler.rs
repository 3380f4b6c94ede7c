//! Broker reconciliation
//!
//! Diffs the ledger's open rows for one broker connection against the
//! positions the broker reports, then repairs local state:
//!
//! - matched symbol, same side: refresh quantity / mark / PnL snapshot when it changed
//! - local row missing at the broker: close it as `closed_externally`
//! - broker position missing locally: open an `external` row
//! - matched symbol, opposite side: close the local row and open an `external` one
//!
//! Only local writes happen here; broker mutation endpoints are never called.
//! Every write carries the open-row precondition, and a failure on one symbol
//! is recorded without aborting the rest of the pass.

use crate::domain::entities::directive::Side;
use crate::domain::entities::position::{
    NewPosition, PositionRecord, PositionSnapshot, PositionSource,
    EXIT_REASON_CLOSED_EXTERNALLY,
};
use crate::domain::errors::{EngineError, ReconciliationError, ValidationError};
use crate::domain::repositories::broker_client::{BrokerClientRegistry, BrokerPosition};
use crate::domain::services::retry::{retry_read, RetryPolicy};
use crate::domain::services::signal_ledger::SignalLedger;
use crate::domain::services::token_manager::TokenManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Aggregate result of one pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub connection_id: String,
    pub updated: usize,
    pub closed: usize,
    pub created: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failures: Vec<ReconciliationError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconciliationSummary {
    fn new(connection_id: &str) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.to_string(),
            updated: 0,
            closed: 0,
            created: 0,
            unchanged: 0,
            failed: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Rows written during the pass
    pub fn writes(&self) -> usize {
        self.updated + self.closed + self.created
    }

    fn fail(&mut self, symbol: &str, reason: impl Into<String>) {
        let failure = ReconciliationError {
            symbol: symbol.to_string(),
            reason: reason.into(),
        };
        error!(connection = %self.connection_id, symbol, "Reconciliation failed: {}", failure.reason);
        self.failed += 1;
        self.failures.push(failure);
    }
}

/// What happened to one symbol
enum Outcome {
    Updated,
    Closed,
    Created,
    Flipped,
    Unchanged,
}

pub struct BrokerReconciler {
    ledger: SignalLedger,
    tokens: Arc<TokenManager>,
    brokers: BrokerClientRegistry,
    read_policy: RetryPolicy,
}

impl BrokerReconciler {
    pub fn new(
        ledger: SignalLedger,
        tokens: Arc<TokenManager>,
        brokers: BrokerClientRegistry,
        read_policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            tokens,
            brokers,
            read_policy,
        }
    }

    /// Pull broker positions for the connection and repair the ledger.
    ///
    /// Fails as a whole only when the broker cannot be read (auth, upstream);
    /// per-position problems end up in `failures`.
    pub async fn run_reconciliation(&self, connection_id: &str) -> Result<ReconciliationSummary, EngineError> {
        let (connection, session) = self.tokens.session_for(connection_id).await?;
        let client = self.brokers.get(connection.broker_type).ok_or_else(|| {
            ValidationError::invalid(
                "broker_type",
                format!("no client configured for {}", connection.broker_type),
            )
        })?;

        let external = retry_read(&self.read_policy, "list_positions", || {
            client.list_positions(&session)
        })
        .await?;

        debug!(
            connection = connection_id,
            broker = %connection.broker_type,
            positions = external.len(),
            "Fetched broker positions"
        );

        Ok(self.reconcile_positions(connection_id, external).await)
    }

    /// Apply a broker snapshot to the ledger rows of `connection_id`
    pub async fn reconcile_positions(
        &self,
        connection_id: &str,
        external: Vec<BrokerPosition>,
    ) -> ReconciliationSummary {
        let mut summary = ReconciliationSummary::new(connection_id);

        let local = match self.ledger.find_all_open(connection_id).await {
            Ok(local) => local,
            Err(e) => {
                summary.fail("*", format!("failed to load local positions: {}", e));
                summary.finished_at = Utc::now();
                return summary;
            }
        };

        // Most recent open row per symbol; find_all_open orders by entry_time desc
        let mut local_by_symbol: BTreeMap<String, PositionRecord> = BTreeMap::new();
        for record in local {
            if local_by_symbol.contains_key(&record.symbol) {
                warn!(
                    connection = connection_id,
                    symbol = %record.symbol,
                    ignored = %record.id,
                    "Duplicate open rows; reconciling the most recent only"
                );
                continue;
            }
            local_by_symbol.insert(record.symbol.clone(), record);
        }

        let mut external_by_symbol: HashMap<String, BrokerPosition> = HashMap::new();
        for position in external {
            if position.side.is_flat() || position.qty.abs() <= f64::EPSILON {
                continue;
            }
            if external_by_symbol.contains_key(&position.symbol) {
                warn!(connection = connection_id, symbol = %position.symbol, "Broker reported symbol twice; using the last entry");
            }
            external_by_symbol.insert(position.symbol.clone(), position);
        }

        for (symbol, record) in &local_by_symbol {
            let result = match external_by_symbol.get(symbol) {
                Some(remote) if remote.side == record.side => self.refresh_snapshot(record, remote).await,
                Some(remote) => self.flip(connection_id, record, remote).await,
                None => self.close_missing(record).await,
            };
            self.tally(&mut summary, symbol, result);
        }

        let mut created_symbols: Vec<&String> = external_by_symbol
            .keys()
            .filter(|symbol| !local_by_symbol.contains_key(*symbol))
            .collect();
        created_symbols.sort();
        for symbol in created_symbols {
            let remote = &external_by_symbol[symbol];
            let result = self.create_external(connection_id, remote).await;
            self.tally(&mut summary, symbol, result);
        }

        summary.finished_at = Utc::now();
        info!(
            connection = connection_id,
            updated = summary.updated,
            closed = summary.closed,
            created = summary.created,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "Reconciliation pass complete"
        );
        summary
    }

    fn tally(&self, summary: &mut ReconciliationSummary, symbol: &str, result: Result<Outcome, String>) {
        match result {
            Ok(Outcome::Updated) => summary.updated += 1,
            Ok(Outcome::Closed) => summary.closed += 1,
            Ok(Outcome::Created) => summary.created += 1,
            Ok(Outcome::Flipped) => {
                summary.closed += 1;
                summary.created += 1;
            }
            Ok(Outcome::Unchanged) => summary.unchanged += 1,
            Err(reason) => summary.fail(symbol, reason),
        }
    }

    async fn refresh_snapshot(&self, record: &PositionRecord, remote: &BrokerPosition) -> Result<Outcome, String> {
        let snapshot = snapshot_of(remote);
        if !snapshot.differs_from(record) {
            return Ok(Outcome::Unchanged);
        }
        let written = self
            .ledger
            .update_snapshot(record, &snapshot)
            .await
            .map_err(|e| e.to_string())?;
        if written {
            debug!(symbol = %record.symbol, "Position snapshot updated");
            Ok(Outcome::Updated)
        } else {
            // Closed concurrently by a live directive
            Ok(Outcome::Unchanged)
        }
    }

    async fn close_missing(&self, record: &PositionRecord) -> Result<Outcome, String> {
        let closed = self
            .ledger
            .close_record(record, record.mark_price, Utc::now(), EXIT_REASON_CLOSED_EXTERNALLY)
            .await
            .map_err(|e| e.to_string())?;
        Ok(if closed { Outcome::Closed } else { Outcome::Unchanged })
    }

    async fn flip(
        &self,
        connection_id: &str,
        record: &PositionRecord,
        remote: &BrokerPosition,
    ) -> Result<Outcome, String> {
        info!(
            symbol = %record.symbol,
            local = %record.side,
            broker = %remote.side,
            "Broker reports opposite side; replacing local row"
        );
        let closed = self
            .ledger
            .close_record(record, record.mark_price, Utc::now(), EXIT_REASON_CLOSED_EXTERNALLY)
            .await
            .map_err(|e| e.to_string())?;
        if !closed {
            return Ok(Outcome::Unchanged);
        }
        match self.create_external(connection_id, remote).await? {
            Outcome::Created => Ok(Outcome::Flipped),
            _ => Ok(Outcome::Closed),
        }
    }

    async fn create_external(&self, connection_id: &str, remote: &BrokerPosition) -> Result<Outcome, String> {
        if !(remote.avg_entry_price.is_finite() && remote.avg_entry_price > 0.0) {
            return Err(format!("invalid average entry price {}", remote.avg_entry_price));
        }
        let snapshot = snapshot_of(remote);
        let position = NewPosition {
            quantity: snapshot.quantity,
            mark_price: snapshot.mark_price,
            unrealized_pnl_pct: snapshot.unrealized_pnl_pct,
            metadata: snapshot.metadata,
            ..NewPosition::new(
                &remote.symbol,
                connection_id,
                remote.side,
                remote.avg_entry_price,
                remote.opened_at.unwrap_or_else(Utc::now),
                PositionSource::External,
            )
        };
        let inserted = self
            .ledger
            .open_position(position)
            .await
            .map_err(|e| e.to_string())?;
        Ok(if inserted.is_some() {
            Outcome::Created
        } else {
            Outcome::Unchanged
        })
    }
}

fn snapshot_of(remote: &BrokerPosition) -> PositionSnapshot {
    let side = match remote.side {
        Side::Long => "long",
        Side::Short => "short",
        Side::Flat => "flat",
    };
    PositionSnapshot {
        quantity: Some(remote.qty.abs()),
        mark_price: remote.mark_price,
        unrealized_pnl_pct: remote.unrealized_pnl_pct,
        metadata: Some(
            json!({
                "avgEntryPrice": remote.avg_entry_price,
                "brokerSide": side,
            })
            .to_string(),
        ),
    }
}
