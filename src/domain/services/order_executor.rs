//! OrderExecutor service - executes action plans against an exchange
//!
//! Every directive for one `(exchange, symbol)` runs under a keyed lock that
//! spans the ledger read, the exchange calls and the ledger write. Plans are
//! executed step by step; a reversal only issues its OPEN once the CLOSE is
//! confirmed, and any failure aborts the remaining steps.

use crate::domain::entities::action_plan::{ActionPlan, ActionStep};
use crate::domain::entities::directive::{Side, TradeDirective};
use crate::domain::entities::exchange::ExchangeConfig;
use crate::domain::entities::execution_intent::{ExecutionIntent, IntentPhase};
use crate::domain::entities::position::{NewPosition, PositionRecord, PositionSource};
use crate::domain::errors::{EngineError, ExecutionError, UpstreamError, UpstreamErrorKind};
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangePosition, OrderAck, OrderRequest,
};
use crate::domain::repositories::intent_repository::IntentRepository;
use crate::domain::services::position_resolver::resolve;
use crate::domain::services::retry::{retry_read, with_timeout, RetryPolicy};
use crate::domain::services::signal_ledger::SignalLedger;
use crate::domain::services::symbol_locks::{symbol_key, KeyedLocks};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Order execution configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bounded retries for position/equity reads
    pub read_policy: RetryPolicy,
    /// Deadline for a single place/close call
    pub mutation_timeout: Duration,
    /// Extra attempts for a mutation, only after the exchange confirmed it did not apply
    pub mutation_retry_attempts: u32,
    /// Position polls used to confirm a close whose response was lost
    pub close_confirm_attempts: u32,
    pub close_confirm_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            read_policy: RetryPolicy::default(),
            mutation_timeout: Duration::from_secs(10),
            mutation_retry_attempts: 1,
            close_confirm_attempts: 5,
            close_confirm_delay: Duration::from_millis(500),
        }
    }
}

/// Result of running one directive against one exchange
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub exchange_id: String,
    pub symbol: String,
    pub previous_side: Side,
    pub plan: ActionPlan,
    /// Ledger row closed by the CLOSE step
    pub closed: Option<PositionRecord>,
    /// Ledger row created by the OPEN step
    pub opened: Option<PositionRecord>,
    pub order: Option<OrderAck>,
}

impl ExecutionReport {
    pub fn pnl_percentage(&self) -> Option<f64> {
        self.closed.as_ref().and_then(|c| c.pnl_percentage)
    }
}

/// Exchange client paired with its execution settings
#[derive(Clone)]
pub struct ExchangeTarget {
    pub config: ExchangeConfig,
    pub client: Arc<dyn ExchangeClient>,
}

pub struct OrderExecutor {
    ledger: SignalLedger,
    intents: Arc<dyn IntentRepository>,
    locks: KeyedLocks,
    config: ExecutorConfig,
}

impl OrderExecutor {
    pub fn new(ledger: SignalLedger, intents: Arc<dyn IntentRepository>, config: ExecutorConfig) -> Self {
        Self {
            ledger,
            intents,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn ledger(&self) -> &SignalLedger {
        &self.ledger
    }

    /// Resolve and execute a directive against one exchange, serialized per symbol
    pub async fn execute(
        &self,
        directive: &TradeDirective,
        target: &ExchangeTarget,
    ) -> Result<ExecutionReport, EngineError> {
        let _guard = self
            .locks
            .acquire(&symbol_key(&target.config.exchange_id, &directive.symbol))
            .await;
        self.execute_locked(directive, target, None).await
    }

    /// Re-drive reversals interrupted between CLOSE and OPEN.
    ///
    /// Each unfinished intent is resolved again against the ledger under the
    /// symbol lock, so a half-finished reversal is completed and a finished one
    /// is a no-op. Returns the number of intents processed.
    pub async fn resume_pending_intents(
        &self,
        targets: &HashMap<String, ExchangeTarget>,
    ) -> Result<usize, EngineError> {
        let pending = self.intents.list_unfinished().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!("Resuming {} unfinished reversal intent(s)", pending.len());

        let mut processed = 0;
        for intent in pending {
            let Some(target) = targets.get(&intent.exchange_id) else {
                warn!(
                    intent = %intent.id,
                    exchange = %intent.exchange_id,
                    "No exchange configured for unfinished intent; leaving it pending"
                );
                continue;
            };

            let mut directive = TradeDirective::new(
                intent.symbol.clone(),
                intent.target_side,
                format!("resume intent {}", intent.id),
            );
            directive.price_hint = intent.price_hint;
            directive.reason_tag = intent.reason_tag.clone();

            let _guard = self
                .locks
                .acquire(&symbol_key(&intent.exchange_id, &intent.symbol))
                .await;
            match self.execute_locked(&directive, target, Some(intent.clone())).await {
                Ok(report) => info!(
                    intent = %intent.id,
                    symbol = %intent.symbol,
                    plan = %report.plan.label(),
                    "Reversal intent resumed"
                ),
                Err(e) => error!(intent = %intent.id, symbol = %intent.symbol, "Failed to resume intent: {}", e),
            }
            processed += 1;
        }
        Ok(processed)
    }

    async fn execute_locked(
        &self,
        directive: &TradeDirective,
        target: &ExchangeTarget,
        resumed: Option<ExecutionIntent>,
    ) -> Result<ExecutionReport, EngineError> {
        let exchange_id = target.config.exchange_id.as_str();
        let symbol = directive.symbol.as_str();

        let previous_side = self.ledger.current_side(symbol, exchange_id).await?;
        let plan = resolve(symbol, previous_side, directive.desired_side);
        debug!(symbol, exchange = exchange_id, current = %previous_side, desired = %directive.desired_side, plan = %plan.label(), "Resolved action plan");

        let mut report = ExecutionReport {
            exchange_id: exchange_id.to_string(),
            symbol: symbol.to_string(),
            previous_side,
            plan: plan.clone(),
            closed: None,
            opened: None,
            order: None,
        };

        if plan.is_no_action() {
            if let Some(intent) = &resumed {
                self.set_phase(intent, IntentPhase::Completed).await;
            }
            return Ok(report);
        }

        let intent = match resumed {
            Some(intent) => Some(intent),
            None if plan.is_reversal() => {
                let intent = ExecutionIntent::reversal(
                    symbol,
                    exchange_id,
                    directive.desired_side,
                    directive.price_hint,
                    directive.reason_tag.clone(),
                );
                self.intents.insert(&intent).await?;
                Some(intent)
            }
            None => None,
        };

        let mut completed: Vec<String> = Vec::new();
        for step in &plan.steps {
            let outcome = match step {
                ActionStep::Close => self.close_step(directive, target, plan.is_reversal(), &completed).await.map(|closed| {
                    report.closed = closed;
                }),
                ActionStep::Open(side) => self.open_step(directive, target, *side, &completed).await.map(|(ack, opened)| {
                    report.order = ack;
                    report.opened = Some(opened);
                }),
            };

            if let Err(e) = outcome {
                error!(symbol, exchange = exchange_id, step = %step, completed = ?completed, "Action plan aborted: {}", e);
                if let Some(intent) = &intent {
                    self.set_phase(intent, IntentPhase::Failed).await;
                }
                return Err(e.into());
            }

            completed.push(step.to_string());
            if let (Some(intent), ActionStep::Close) = (&intent, step) {
                self.set_phase(intent, IntentPhase::Closed).await;
            }
        }

        if let Some(intent) = &intent {
            self.set_phase(intent, IntentPhase::Completed).await;
        }

        info!(
            symbol,
            exchange = exchange_id,
            plan = %plan.label(),
            pnl_percentage = ?report.pnl_percentage(),
            "Directive executed"
        );
        Ok(report)
    }

    async fn set_phase(&self, intent: &ExecutionIntent, phase: IntentPhase) {
        if let Err(e) = self.intents.update_phase(&intent.id, phase).await {
            warn!(intent = %intent.id, "Failed to advance intent to {}: {}", phase.as_str(), e);
        }
    }

    async fn read_position(&self, client: &dyn ExchangeClient, symbol: &str) -> Result<ExchangePosition, UpstreamError> {
        retry_read(&self.config.read_policy, "get_position", || client.get_position(symbol)).await
    }

    /// Poll the exchange until the position reads flat.
    /// `Ok(false)` means every successful read still showed exposure.
    async fn confirm_flat(&self, client: &dyn ExchangeClient, symbol: &str) -> Result<bool, UpstreamError> {
        let attempts = self.config.close_confirm_attempts.max(1);
        let mut last_error = None;
        let mut any_read = false;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.close_confirm_delay).await;
            }
            match self.read_position(client, symbol).await {
                Ok(position) if position.is_flat() => return Ok(true),
                Ok(position) => {
                    any_read = true;
                    debug!(symbol, size = position.size, attempt, "Position still open while confirming close");
                }
                Err(e) => last_error = Some(e),
            }
        }
        match (any_read, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(false),
        }
    }

    async fn close_step(
        &self,
        directive: &TradeDirective,
        target: &ExchangeTarget,
        reversal: bool,
        completed: &[String],
    ) -> Result<Option<PositionRecord>, ExecutionError> {
        let client = target.client.as_ref();
        let symbol = directive.symbol.as_str();
        let exchange_id = target.config.exchange_id.as_str();

        let attempts = 1 + self.config.mutation_retry_attempts;
        let mut exit_price = None;
        let mut confirmed = false;
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..attempts {
            match with_timeout("close_position", self.config.mutation_timeout, client.close_position(symbol)).await {
                Ok(ack) => {
                    exit_price = ack.exit_price;
                    confirmed = true;
                    break;
                }
                Err(e) => {
                    warn!(symbol, exchange = exchange_id, attempt = attempt + 1, "Close failed, verifying exchange state: {}", e);
                    match self.confirm_flat(client, symbol).await {
                        Ok(true) => {
                            info!(symbol, exchange = exchange_id, "Close confirmed by position query");
                            confirmed = true;
                            break;
                        }
                        Ok(false) if retryable_mutation(&e) => last_error = Some(e),
                        Ok(false) => {
                            last_error = Some(e);
                            break;
                        }
                        Err(read_error) => {
                            error!(symbol, exchange = exchange_id, "Could not verify close: {}", read_error);
                            return Err(ExecutionError::CloseUnconfirmed {
                                symbol: symbol.to_string(),
                                exchange: exchange_id.to_string(),
                            });
                        }
                    }
                }
            }
        }

        if !confirmed {
            return Err(match last_error {
                Some(source) => ExecutionError::StepFailed {
                    symbol: symbol.to_string(),
                    exchange: exchange_id.to_string(),
                    step: ActionStep::Close.to_string(),
                    completed: completed.to_vec(),
                    source,
                },
                None => ExecutionError::CloseUnconfirmed {
                    symbol: symbol.to_string(),
                    exchange: exchange_id.to_string(),
                },
            });
        }

        // The alert price is authoritative; the venue's fill is the fallback
        let exit_price = directive.price_hint.or(exit_price);
        let reason = directive
            .reason_tag
            .clone()
            .unwrap_or_else(|| if reversal { "reversal" } else { "signal" }.to_string());

        self.ledger
            .close_position(symbol, exchange_id, exit_price, Utc::now(), &reason)
            .await
            .map_err(|e| ExecutionError::LedgerWriteFailed {
                symbol: symbol.to_string(),
                exchange: exchange_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn open_step(
        &self,
        directive: &TradeDirective,
        target: &ExchangeTarget,
        side: Side,
        completed: &[String],
    ) -> Result<(Option<OrderAck>, PositionRecord), ExecutionError> {
        let client = target.client.as_ref();
        let symbol = directive.symbol.as_str();
        let exchange_id = target.config.exchange_id.as_str();
        let step = ActionStep::Open(side).to_string();
        let step_failed = |source: UpstreamError| ExecutionError::StepFailed {
            symbol: symbol.to_string(),
            exchange: exchange_id.to_string(),
            step: step.clone(),
            completed: completed.to_vec(),
            source,
        };

        let equity = retry_read(&self.config.read_policy, "get_account_equity", || {
            client.get_account_equity()
        })
        .await
        .map_err(&step_failed)?;

        let notional = target.config.notional_for(equity);
        if !(notional.is_finite() && notional > 0.0) {
            return Err(ExecutionError::InvalidSize {
                symbol: symbol.to_string(),
                reason: format!(
                    "{}% of equity {} gives notional {}",
                    target.config.position_sizing_percentage, equity, notional
                ),
            });
        }

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            size_percent: target.config.position_sizing_percentage,
            notional,
        };

        let attempts = 1 + self.config.mutation_retry_attempts;
        let mut ack: Option<OrderAck> = None;
        let mut verified_position: Option<ExchangePosition> = None;
        let mut last_error: Option<UpstreamError> = None;

        for attempt in 0..attempts {
            match with_timeout("place_order", self.config.mutation_timeout, client.place_order(&request)).await {
                Ok(order) => {
                    ack = Some(order);
                    break;
                }
                Err(e) => {
                    warn!(symbol, exchange = exchange_id, attempt = attempt + 1, "Order failed, verifying exchange state: {}", e);
                    match self.read_position(client, symbol).await {
                        Ok(position) if position.side == side && !position.is_flat() => {
                            info!(symbol, exchange = exchange_id, "Order took effect despite error");
                            verified_position = Some(position);
                            break;
                        }
                        Ok(_) if retryable_mutation(&e) => last_error = Some(e),
                        Ok(_) => return Err(step_failed(e)),
                        Err(read_error) => {
                            error!(symbol, exchange = exchange_id, "Could not verify order state: {}", read_error);
                            return Err(step_failed(e));
                        }
                    }
                }
            }
        }

        if ack.is_none() && verified_position.is_none() {
            let source = last_error
                .unwrap_or_else(|| UpstreamError::rejected("place_order", "order not acknowledged"));
            return Err(step_failed(source));
        }

        let mut entry_price = directive
            .price_hint
            .or_else(|| ack.as_ref().and_then(|a| a.avg_price))
            .or_else(|| verified_position.as_ref().and_then(|p| p.entry_price));
        if entry_price.is_none() {
            entry_price = self
                .read_position(client, symbol)
                .await
                .ok()
                .and_then(|p| p.entry_price);
        }
        let Some(entry_price) = entry_price.filter(|p| p.is_finite() && *p > 0.0) else {
            return Err(ExecutionError::MissingFillPrice {
                symbol: symbol.to_string(),
                exchange: exchange_id.to_string(),
            });
        };

        let position = NewPosition {
            quantity: verified_position.as_ref().map(|p| p.size),
            ..NewPosition::new(symbol, exchange_id, side, entry_price, Utc::now(), PositionSource::Signal)
        };
        let ledger_failed = |reason: String| ExecutionError::LedgerWriteFailed {
            symbol: symbol.to_string(),
            exchange: exchange_id.to_string(),
            reason,
        };
        let opened = self
            .ledger
            .open_position(position)
            .await
            .map_err(|e| ledger_failed(e.to_string()))?
            .ok_or_else(|| ledger_failed("an open row already exists".to_string()))?;

        Ok((ack, opened))
    }
}

/// Whether a failed mutation may be re-issued once the exchange shows it did not apply
fn retryable_mutation(error: &UpstreamError) -> bool {
    match error.kind {
        UpstreamErrorKind::Rejected | UpstreamErrorKind::Unauthorized => false,
        UpstreamErrorKind::Status(code) => code == 429 || code >= 500,
        UpstreamErrorKind::Timeout | UpstreamErrorKind::Network | UpstreamErrorKind::Decode => true,
    }
}
