//! In-process store used by the CLI `run` command and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::ExecutionStore;
use crate::error::StoreError;
use crate::models::{Execution, StepExecution, WorkflowDefinition};

#[derive(Default)]
struct Tables {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    executions: HashMap<Uuid, Execution>,
    steps: HashMap<(Uuid, String), StepExecution>,
}

/// Keeps every record in memory.
///
/// `fail_next_writes(n)` makes the next `n` save calls fail with
/// [`StoreError::Unavailable`].
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    failing_writes: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_definition(&self, definition: WorkflowDefinition) {
        self.tables().definitions.insert(definition.id, definition);
    }

    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// The stored record of one step, if any was saved.
    pub fn step_record(&self, execution_id: Uuid, node_id: &str) -> Option<StepExecution> {
        self.tables()
            .steps
            .get(&(execution_id, node_id.to_owned()))
            .cloned()
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let take = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match take {
            Ok(_) => Err(StoreError::Unavailable("injected write failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn load_workflow_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.tables()
            .definitions
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow {workflow_id}")))
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.injected_failure()?;
        self.tables().executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn save_step_execution(&self, execution_id: Uuid, step: &StepExecution) -> Result<(), StoreError> {
        self.injected_failure()?;
        self.tables()
            .steps
            .insert((execution_id, step.node_id.clone()), step.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, StoreError> {
        let tables = self.tables();
        let mut execution = tables
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        for step in &mut execution.steps {
            if let Some(saved) = tables.steps.get(&(execution_id, step.node_id.clone())) {
                *step = saved.clone();
            }
        }
        Ok(execution)
    }
}
