//! Broker reconciliation end to end: scripted broker -> reconciler -> ledger

mod common;

use alertdesk::application::actors::reconciliation_actor::ReconciliationActor;
use alertdesk::domain::entities::directive::Side;
use alertdesk::domain::entities::position::{
    NewPosition, PositionSource, PositionStatus, EXIT_REASON_CLOSED_EXTERNALLY,
};
use alertdesk::persistence::reconciliation_audit::{
    SqliteReconciliationAuditRepository, STATUS_FAILED, STATUS_OK,
};
use chrono::Utc;
use common::{broker_position, harness, Harness, ScriptedBroker};
use std::time::Duration;

const CONNECTION: &str = "conn-1";

async fn open_signal_row(h: &Harness, symbol: &str, side: Side, entry_price: f64) {
    h.ledger
        .open_position(NewPosition::new(
            symbol,
            CONNECTION,
            side,
            entry_price,
            Utc::now(),
            PositionSource::Signal,
        ))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_external_position_creates_local_row() {
    let h = harness().await;
    h.add_connection(CONNECTION, 3600).await;
    let broker = ScriptedBroker::new(vec![broker_position("AAPL", Side::Long, 190.0, 10.0)]);
    let reconciler = h.reconciler(&broker);

    let summary = reconciler.run_reconciliation(CONNECTION).await.unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.writes(), 1);
    assert_eq!(summary.failed, 0);

    let history = h.ledger.history("AAPL", CONNECTION).await.unwrap();
    assert_eq!(history.len(), 1);
    let row = &history[0];
    assert_eq!(row.status, PositionStatus::Open);
    assert_eq!(row.source, PositionSource::External);
    assert_eq!(row.side, Side::Long);
    assert_eq!(row.entry_price, 190.0);
    assert_eq!(row.quantity, Some(10.0));
}

#[tokio::test]
async fn test_missing_at_broker_closes_local_row() {
    let h = harness().await;
    h.add_connection(CONNECTION, 3600).await;
    open_signal_row(&h, "TSLA", Side::Long, 250.0).await;
    let broker = ScriptedBroker::new(Vec::new());
    let reconciler = h.reconciler(&broker);

    let summary = reconciler.run_reconciliation(CONNECTION).await.unwrap();

    assert_eq!(summary.closed, 1);
    let history = h.ledger.history("TSLA", CONNECTION).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PositionStatus::Closed);
    assert_eq!(
        history[0].exit_reason.as_deref(),
        Some(EXIT_REASON_CLOSED_EXTERNALLY)
    );
    // No mark price known, so no PnL is invented
    assert_eq!(history[0].pnl_percentage, None);
}

#[tokio::test]
async fn test_second_pass_with_unchanged_broker_writes_nothing() {
    let h = harness().await;
    h.add_connection(CONNECTION, 3600).await;
    open_signal_row(&h, "NVDA", Side::Long, 120.0).await;
    let broker = ScriptedBroker::new(vec![
        broker_position("AAPL", Side::Long, 190.0, 10.0),
        broker_position("MSFT", Side::Short, 410.0, 3.0),
        broker_position("NVDA", Side::Long, 120.0, 8.0),
    ]);
    let reconciler = h.reconciler(&broker);

    let first = reconciler.run_reconciliation(CONNECTION).await.unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(first.updated, 1);

    let rows_after_first = h.row_count().await;
    let second = reconciler.run_reconciliation(CONNECTION).await.unwrap();

    assert_eq!(second.writes(), 0);
    assert_eq!(second.unchanged, 3);
    assert_eq!(h.row_count().await, rows_after_first);
}

#[tokio::test]
async fn test_opposite_side_at_broker_replaces_local_row() {
    let h = harness().await;
    h.add_connection(CONNECTION, 3600).await;
    open_signal_row(&h, "AAPL", Side::Long, 180.0).await;
    let broker = ScriptedBroker::new(vec![broker_position("AAPL", Side::Short, 195.0, 4.0)]);
    let reconciler = h.reconciler(&broker);

    let summary = reconciler.run_reconciliation(CONNECTION).await.unwrap();

    assert_eq!(summary.closed, 1);
    assert_eq!(summary.created, 1);

    let open = h.ledger.find_open("AAPL", CONNECTION).await.unwrap().unwrap();
    assert_eq!(open.side, Side::Short);
    assert_eq!(open.source, PositionSource::External);

    let history = h.ledger.history("AAPL", CONNECTION).await.unwrap();
    let closed: Vec<_> = history.iter().filter(|p| !p.is_open()).collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].side, Side::Long);
    assert_eq!(
        closed[0].exit_reason.as_deref(),
        Some(EXIT_REASON_CLOSED_EXTERNALLY)
    );
}

#[tokio::test]
async fn test_bad_position_does_not_block_the_pass() {
    let h = harness().await;
    h.add_connection(CONNECTION, 3600).await;
    let broker = ScriptedBroker::new(vec![
        broker_position("BAD", Side::Long, 0.0, 1.0),
        broker_position("GOOD", Side::Long, 50.0, 2.0),
    ]);
    let reconciler = h.reconciler(&broker);

    let summary = reconciler.run_reconciliation(CONNECTION).await.unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].symbol, "BAD");
    assert!(h.ledger.find_open("GOOD", CONNECTION).await.unwrap().is_some());
    assert!(h.ledger.find_open("BAD", CONNECTION).await.unwrap().is_none());
}

#[tokio::test]
async fn test_actor_serialises_passes_and_records_audit() {
    let h = harness().await;
    h.add_connection(CONNECTION, 3600).await;
    let broker = ScriptedBroker::new(vec![broker_position("AAPL", Side::Long, 190.0, 10.0)]);
    let audit = SqliteReconciliationAuditRepository::new(h.pool.clone());
    let handle = ReconciliationActor::new(
        h.reconciler(&broker),
        h.connections.clone(),
        Some(audit.clone()),
        Duration::from_secs(5),
    )
    .spawn();

    let summary = handle.reconcile(CONNECTION).await.unwrap();
    assert_eq!(summary.created, 1);

    let record = audit.last_for(CONNECTION).await.unwrap().unwrap();
    assert_eq!(record.status, STATUS_OK);
    assert_eq!(record.created, 1);

    let outcomes = handle.reconcile_all().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].connection_id, CONNECTION);
    assert_eq!(outcomes[0].result.as_ref().unwrap().unchanged, 1);

    assert!(handle.reconcile("missing").await.is_err());
    let failure = audit.last_for("missing").await.unwrap().unwrap();
    assert_eq!(failure.status, STATUS_FAILED);
    assert!(failure.error.is_some());

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.total_reconciliations, 3);
    assert_eq!(stats.successful_reconciliations, 2);
    assert_eq!(stats.failed_reconciliations, 1);
    assert_eq!(broker.list_calls(), 2);

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handle.reconcile(CONNECTION).await.is_err());
}
