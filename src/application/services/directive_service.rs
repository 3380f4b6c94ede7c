//! Directive service
//!
//! Entry point behind the webhook: parses the payload, records rejects in the
//! audit log, drops duplicate deliveries and runs the directive against every
//! active exchange concurrently.

use crate::domain::entities::directive::{Side, TradeDirective};
use crate::domain::errors::{EngineError, ParseError};
use crate::domain::repositories::audit_repository::{
    AuditEvent, AuditRepository, EVENT_DIRECTIVE_EXECUTED, EVENT_DIRECTIVE_FAILED,
    EVENT_DIRECTIVE_REJECTED,
};
use crate::domain::services::directive_parser::{parse_payload, DirectivePayload};
use crate::domain::services::order_executor::{ExchangeTarget, ExecutionReport, OrderExecutor};
use futures_util::future::join_all;
use lru::LruCache;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// `(exchange, symbol, side, barTime)`
type DedupeKey = (String, String, Side, String);

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSummary {
    pub exchange: String,
    /// Plan label, e.g. `CLOSE+OPEN(SHORT)` or `NO_ACTION`
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    pub previous_side: Side,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percentage: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub exchange: String,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
}

/// Body of a successful directive response
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderSummary>,
    pub actions: Vec<ActionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_percentage: Option<f64>,
}

pub struct DirectiveService {
    executor: Arc<OrderExecutor>,
    targets: Vec<ExchangeTarget>,
    audit: Arc<dyn AuditRepository>,
    dedupe: Mutex<LruCache<DedupeKey, ()>>,
}

impl DirectiveService {
    /// `targets` may include inactive configs; those are skipped
    pub fn new(
        executor: Arc<OrderExecutor>,
        targets: impl IntoIterator<Item = ExchangeTarget>,
        audit: Arc<dyn AuditRepository>,
        dedupe_cache_size: usize,
    ) -> Self {
        let mut targets: Vec<ExchangeTarget> = targets
            .into_iter()
            .filter(|t| {
                if !t.config.is_active {
                    info!("Exchange {} inactive; directives will skip it", t.config.exchange_id);
                }
                t.config.is_active
            })
            .collect();
        targets.sort_by(|a, b| a.config.exchange_id.cmp(&b.config.exchange_id));

        let capacity = NonZeroUsize::new(dedupe_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            executor,
            targets,
            audit,
            dedupe: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    /// Handle a raw request body. Undecodable JSON is audited and rejected with 400.
    pub async fn handle_body(&self, body: &[u8]) -> Result<DirectiveResponse, EngineError> {
        let payload: DirectivePayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                let raw = String::from_utf8_lossy(body).to_string();
                let error = ParseError::new(raw, format!("invalid JSON: {}", e));
                self.audit_rejection(&error.raw, &error.reason).await;
                return Err(error.into());
            }
        };
        self.handle(&payload).await
    }

    pub async fn handle(&self, payload: &DirectivePayload) -> Result<DirectiveResponse, EngineError> {
        let directive = match parse_payload(payload) {
            Ok(directive) => directive,
            Err(e) => {
                let raw = match (&e, payload) {
                    (EngineError::Parse(parse), _) => parse.raw.clone(),
                    (_, DirectivePayload::Alert { alert_text }) => alert_text.clone(),
                    (_, structured) => serde_json::to_string(structured).unwrap_or_default(),
                };
                self.audit_rejection(&raw, &e.to_string()).await;
                return Err(e);
            }
        };
        self.dispatch(directive).await
    }

    /// Run a parsed directive against every active exchange
    pub async fn dispatch(&self, directive: TradeDirective) -> Result<DirectiveResponse, EngineError> {
        if self.targets.is_empty() {
            warn!(symbol = %directive.symbol, "No active exchanges; directive ignored");
            return Ok(DirectiveResponse {
                success: true,
                message: "No active exchanges configured".to_string(),
                order: None,
                actions: Vec::new(),
                pnl_percentage: None,
            });
        }

        let runs = self
            .targets
            .iter()
            .map(|target| self.run_on(&directive, target));
        let results = join_all(runs).await;

        let mut actions = Vec::with_capacity(results.len());
        let mut order = None;
        let mut pnl_percentage = None;
        let mut first_error = None;

        for (target, result) in self.targets.iter().zip(results) {
            let exchange_id = target.config.exchange_id.as_str();
            match result {
                Ok(Some(report)) => {
                    if order.is_none() {
                        order = report.order.as_ref().map(|ack| OrderSummary {
                            exchange: exchange_id.to_string(),
                            order_id: ack.order_id.clone(),
                            avg_price: ack
                                .avg_price
                                .or_else(|| report.opened.as_ref().map(|o| o.entry_price)),
                        });
                    }
                    if pnl_percentage.is_none() {
                        pnl_percentage = report.pnl_percentage();
                    }
                    actions.push(ActionSummary {
                        exchange: exchange_id.to_string(),
                        action: report.plan.label(),
                        side: report.plan.target_side(),
                        previous_side: report.previous_side,
                        pnl_percentage: report.pnl_percentage(),
                        duplicate: false,
                    });
                }
                Ok(None) => {
                    let ledger = self.executor.ledger();
                    match ledger.current_side(&directive.symbol, exchange_id).await {
                        Ok(previous_side) => actions.push(ActionSummary {
                            exchange: exchange_id.to_string(),
                            action: "NO_ACTION".to_string(),
                            side: None,
                            previous_side,
                            pnl_percentage: None,
                            duplicate: true,
                        }),
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(EngineError::from(e));
                            }
                        }
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        let all_duplicates = actions.iter().all(|a| a.duplicate);
        let message = if all_duplicates {
            format!("Duplicate delivery for {}; no action", directive.symbol)
        } else {
            format!("Directive {} {} processed", directive.desired_side, directive.symbol)
        };
        Ok(DirectiveResponse {
            success: true,
            message,
            order,
            actions,
            pnl_percentage,
        })
    }

    /// `Ok(None)` means the delivery was a duplicate and nothing ran
    async fn run_on(
        &self,
        directive: &TradeDirective,
        target: &ExchangeTarget,
    ) -> Result<Option<ExecutionReport>, EngineError> {
        let exchange_id = target.config.exchange_id.as_str();
        let key = directive.bar_time.as_ref().map(|bar_time| {
            (
                exchange_id.to_string(),
                directive.symbol.clone(),
                directive.desired_side,
                bar_time.clone(),
            )
        });
        if let Some(key) = &key {
            if self.seen(key) {
                debug!(symbol = %directive.symbol, exchange = exchange_id, "Duplicate delivery skipped");
                return Ok(None);
            }
        }

        match self.executor.execute(directive, target).await {
            Ok(report) => {
                if let Some(key) = key {
                    self.remember(key);
                }
                self.record(
                    AuditEvent::new(
                        EVENT_DIRECTIVE_EXECUTED,
                        exchange_id,
                        json!({
                            "raw": directive.raw_source,
                            "side": directive.desired_side,
                            "action": report.plan.label(),
                            "previousSide": report.previous_side,
                            "pnlPercentage": report.pnl_percentage(),
                        }),
                    )
                    .with_symbol(&directive.symbol),
                )
                .await;
                Ok(Some(report))
            }
            Err(e) => {
                self.record(
                    AuditEvent::new(
                        EVENT_DIRECTIVE_FAILED,
                        exchange_id,
                        json!({
                            "raw": directive.raw_source,
                            "side": directive.desired_side,
                            "error": e.to_string(),
                        }),
                    )
                    .with_symbol(&directive.symbol),
                )
                .await;
                Err(e)
            }
        }
    }

    fn seen(&self, key: &DedupeKey) -> bool {
        match self.dedupe.lock() {
            Ok(mut cache) => cache.get(key).is_some(),
            Err(_) => false,
        }
    }

    fn remember(&self, key: DedupeKey) {
        if let Ok(mut cache) = self.dedupe.lock() {
            cache.put(key, ());
        }
    }

    async fn audit_rejection(&self, raw: &str, reason: &str) {
        warn!("Directive rejected: {}", reason);
        self.record(AuditEvent::new(
            EVENT_DIRECTIVE_REJECTED,
            "*",
            json!({ "raw": raw, "reason": reason }),
        ))
        .await;
    }

    async fn record(&self, event: AuditEvent) {
        let event_type = event.event_type.clone();
        if let Err(e) = self.audit.record(event).await {
            warn!("Failed to write {} audit entry: {}", event_type, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::ExchangeConfig;
    use crate::domain::repositories::exchange_client::ExchangeClient;
    use crate::domain::services::order_executor::ExecutorConfig;
    use crate::domain::services::signal_ledger::SignalLedger;
    use crate::infrastructure::paper_exchange::PaperExchange;
    use crate::persistence::init_database;
    use crate::persistence::repository::{
        AuditLogRepository, SqliteIntentRepository, SqlitePositionRepository,
    };

    async fn service(exchanges: &[(&str, bool)]) -> (DirectiveService, Arc<AuditLogRepository>) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let audit = Arc::new(AuditLogRepository::new(pool.clone()));
        let ledger = SignalLedger::new(Arc::new(SqlitePositionRepository::new(pool.clone())), audit.clone());
        let executor = Arc::new(OrderExecutor::new(
            ledger,
            Arc::new(SqliteIntentRepository::new(pool)),
            ExecutorConfig::default(),
        ));
        let targets: Vec<ExchangeTarget> = exchanges
            .iter()
            .map(|(id, active)| {
                let paper = PaperExchange::new(*id, 10_000.0);
                paper.update_price("BTCUSD", 100.0);
                ExchangeTarget {
                    config: ExchangeConfig::new(*id, 10.0, *active).unwrap(),
                    client: Arc::new(paper) as Arc<dyn ExchangeClient>,
                }
            })
            .collect();
        (DirectiveService::new(executor, targets, audit.clone(), 16), audit)
    }

    fn structured(body: &str) -> DirectivePayload {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_unparseable_alert_is_audited() {
        let (service, audit) = service(&[("paper", true)]).await;
        let payload = DirectivePayload::Alert {
            alert_text: "moon soon BTCUSD".to_string(),
        };
        let error = service.handle(&payload).await.unwrap_err();
        assert_eq!(error.status_code(), 400);

        let rejected = audit.get_by_event_type(EVENT_DIRECTIVE_REJECTED, 10).await.unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].details.contains("moon soon BTCUSD"));
    }

    #[tokio::test]
    async fn test_invalid_json_body_is_rejected() {
        let (service, audit) = service(&[("paper", true)]).await;
        let error = service.handle_body(b"{not json").await.unwrap_err();
        assert_eq!(error.status_code(), 400);
        assert_eq!(audit.get_by_event_type(EVENT_DIRECTIVE_REJECTED, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_skips_inactive_exchanges() {
        let (service, _) = service(&[("paper-a", true), ("paper-b", true), ("paper-c", false)]).await;
        let response = service
            .handle(&structured(r#"{"symbol":"BTCUSD","action":"BUY"}"#))
            .await
            .unwrap();
        assert!(response.success);
        let exchanges: Vec<&str> = response.actions.iter().map(|a| a.exchange.as_str()).collect();
        assert_eq!(exchanges, vec!["paper-a", "paper-b"]);
        assert!(response.actions.iter().all(|a| a.action == "OPEN(LONG)"));
        assert_eq!(response.order.as_ref().unwrap().avg_price, Some(100.0));
    }

    #[tokio::test]
    async fn test_duplicate_bar_time_short_circuits() {
        let (service, audit) = service(&[("paper", true)]).await;
        let body = r#"{"symbol":"BTCUSD","action":"SELL","positionAfter":-1,"barTime":"2024-05-01T10:00:00Z"}"#;

        let first = service.handle(&structured(body)).await.unwrap();
        assert_eq!(first.actions[0].action, "OPEN(SHORT)");

        let second = service.handle(&structured(body)).await.unwrap();
        assert_eq!(second.actions[0].action, "NO_ACTION");
        assert!(second.actions[0].duplicate);
        assert_eq!(second.actions[0].previous_side, Side::Short);
        assert!(second.message.contains("Duplicate"));

        let executed = audit.get_by_event_type(EVENT_DIRECTIVE_EXECUTED, 10).await.unwrap();
        assert_eq!(executed.len(), 1);
    }

    #[tokio::test]
    async fn test_without_bar_time_repeat_is_idempotent() {
        let (service, _) = service(&[("paper", true)]).await;
        let body = r#"{"symbol":"BTCUSD","action":"BUY"}"#;
        service.handle(&structured(body)).await.unwrap();
        let second = service.handle(&structured(body)).await.unwrap();
        assert_eq!(second.actions[0].action, "NO_ACTION");
        assert!(!second.actions[0].duplicate);
    }
}
