//! Persistence collaborator.
//!
//! The engine only needs to load definitions and write execution records at
//! state transitions. Failures are infrastructure errors: the scheduler
//! retries them and eventually fails the execution.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Execution, StepExecution, WorkflowDefinition};

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn load_workflow_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError>;

    /// Save the execution header. `execution.steps` is not persisted here;
    /// every step is saved through [`ExecutionStore::save_step_execution`].
    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn save_step_execution(&self, execution_id: Uuid, step: &StepExecution) -> Result<(), StoreError>;

    /// Reassemble an execution and its step records.
    async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, StoreError>;
}
