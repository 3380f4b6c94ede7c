use crate::domain::entities::execution_intent::{ExecutionIntent, IntentPhase};
use crate::domain::errors::PersistenceError;
use async_trait::async_trait;

#[async_trait]
pub trait IntentRepository: Send + Sync {
    async fn insert(&self, intent: &ExecutionIntent) -> Result<(), PersistenceError>;

    async fn update_phase(&self, id: &str, phase: IntentPhase) -> Result<(), PersistenceError>;

    /// Intents still `pending` or `closed`, oldest first
    async fn list_unfinished(&self) -> Result<Vec<ExecutionIntent>, PersistenceError>;
}
