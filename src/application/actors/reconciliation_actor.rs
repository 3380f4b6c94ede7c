//! Reconciliation Actor
//!
//! Serialises reconciliation passes: the HTTP trigger and the periodic
//! scheduler both send messages here, so two passes never run at once.
//! Every pass (successful or not) is written to the reconciliation audit.

use crate::domain::errors::EngineError;
use crate::domain::repositories::connection_repository::ConnectionRepository;
use crate::domain::services::broker_reconciler::{BrokerReconciler, ReconciliationSummary};
use crate::persistence::reconciliation_audit::SqliteReconciliationAuditRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Channel capacity for reconciliation actor messages
const RECONCILIATION_CHANNEL_CAPACITY: usize = 100;

/// Outcome of one connection inside a `ReconcileAll` sweep
#[derive(Debug)]
pub struct ConnectionOutcome {
    pub connection_id: String,
    pub result: Result<ReconciliationSummary, String>,
}

/// Messages that can be sent to the reconciliation actor
#[derive(Debug)]
pub enum ReconciliationMessage {
    /// Reconcile one broker connection
    Reconcile {
        connection_id: String,
        reply: oneshot::Sender<Result<ReconciliationSummary, EngineError>>,
    },

    /// Reconcile every valid auto-sync connection
    ReconcileAll {
        reply: oneshot::Sender<Result<Vec<ConnectionOutcome>, EngineError>>,
    },

    GetStats {
        reply: oneshot::Sender<ReconciliationStats>,
    },

    /// Shutdown the actor
    Shutdown,
}

/// Reconciliation actor statistics
#[derive(Debug, Clone, Default)]
pub struct ReconciliationStats {
    pub total_reconciliations: u64,
    pub successful_reconciliations: u64,
    pub failed_reconciliations: u64,
    pub last_reconciliation: Option<DateTime<Utc>>,
}

/// Reconciliation Actor
pub struct ReconciliationActor {
    reconciler: Arc<BrokerReconciler>,
    connections: Arc<dyn ConnectionRepository>,
    audit: Option<SqliteReconciliationAuditRepository>,
    pass_timeout: Duration,
    stats: ReconciliationStats,
}

impl ReconciliationActor {
    pub fn new(
        reconciler: Arc<BrokerReconciler>,
        connections: Arc<dyn ConnectionRepository>,
        audit: Option<SqliteReconciliationAuditRepository>,
        pass_timeout: Duration,
    ) -> Self {
        Self {
            reconciler,
            connections,
            audit,
            pass_timeout,
            stats: ReconciliationStats::default(),
        }
    }

    /// Spawn the actor and return a handle to it
    pub fn spawn(self) -> ReconciliationHandle {
        let (tx, rx) = mpsc::channel(RECONCILIATION_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            self.run(rx).await;
        });

        info!("ReconciliationActor spawned");
        ReconciliationHandle { sender: tx }
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<ReconciliationMessage>) {
        info!("ReconciliationActor started");

        while let Some(msg) = rx.recv().await {
            match msg {
                ReconciliationMessage::Reconcile { connection_id, reply } => {
                    debug!("ReconciliationActor received Reconcile for {}", connection_id);
                    let result = self.reconcile_connection(&connection_id).await;
                    if reply.send(result).is_err() {
                        warn!("Reconcile caller for {} went away", connection_id);
                    }
                }

                ReconciliationMessage::ReconcileAll { reply } => {
                    debug!("ReconciliationActor received ReconcileAll");
                    let result = self.reconcile_all().await;
                    if reply.send(result).is_err() {
                        warn!("ReconcileAll caller went away");
                    }
                }

                ReconciliationMessage::GetStats { reply } => {
                    let _ = reply.send(self.stats.clone());
                }

                ReconciliationMessage::Shutdown => {
                    info!("ReconciliationActor received shutdown signal");
                    break;
                }
            }
        }

        info!("ReconciliationActor stopped");
    }

    async fn reconcile_connection(&mut self, connection_id: &str) -> Result<ReconciliationSummary, EngineError> {
        let started_at = Utc::now();
        let result = match timeout(self.pass_timeout, self.reconciler.run_reconciliation(connection_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Reconciliation timed out for {}", connection_id);
                Err(crate::domain::errors::UpstreamError::timeout("run_reconciliation").into())
            }
        };

        self.stats.total_reconciliations += 1;
        self.stats.last_reconciliation = Some(Utc::now());
        match &result {
            Ok(summary) => {
                self.stats.successful_reconciliations += 1;
                if let Some(audit) = &self.audit {
                    if let Err(e) = audit.save(summary).await {
                        error!("Failed to record reconciliation audit for {}: {}", connection_id, e);
                    }
                }
            }
            Err(e) => {
                self.stats.failed_reconciliations += 1;
                warn!("Reconciliation failed for {}: {}", connection_id, e);
                if let Some(audit) = &self.audit {
                    if let Err(audit_error) = audit.save_failure(connection_id, started_at, &e.to_string()).await {
                        error!(
                            "Failed to record reconciliation failure for {}: {}",
                            connection_id, audit_error
                        );
                    }
                }
            }
        }
        result
    }

    async fn reconcile_all(&mut self) -> Result<Vec<ConnectionOutcome>, EngineError> {
        let connections = self.connections.list_auto_sync().await?;
        debug!("Reconciling {} auto-sync connections", connections.len());

        let mut outcomes = Vec::with_capacity(connections.len());
        for connection in connections {
            let result = self
                .reconcile_connection(&connection.id)
                .await
                .map_err(|e| e.to_string());
            outcomes.push(ConnectionOutcome {
                connection_id: connection.id,
                result,
            });
        }
        Ok(outcomes)
    }
}

/// Cloneable sender side of the actor
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: mpsc::Sender<ReconciliationMessage>,
}

impl ReconciliationHandle {
    fn stopped() -> EngineError {
        crate::domain::errors::UpstreamError::network("reconciliation_actor", "actor is not running").into()
    }

    pub async fn reconcile(&self, connection_id: &str) -> Result<ReconciliationSummary, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ReconciliationMessage::Reconcile {
                connection_id: connection_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())?
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ConnectionOutcome>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(ReconciliationMessage::ReconcileAll { reply })
            .await
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())?
    }

    pub async fn stats(&self) -> Option<ReconciliationStats> {
        let (reply, rx) = oneshot::channel();
        self.sender.send(ReconciliationMessage::GetStats { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ReconciliationMessage::Shutdown).await;
    }
}
