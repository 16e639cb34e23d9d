//! [`ExecutionStore`] backed by the `db` crate's Postgres repositories.

use std::collections::HashMap;

use async_trait::async_trait;
use db::models::{NodeExecutionRow, WorkflowExecutionRow};
use db::DbPool;
use uuid::Uuid;

use super::ExecutionStore;
use crate::error::StoreError;
use crate::models::{Execution, StepExecution, WorkflowDefinition};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn not_found_as(what: String) -> impl FnOnce(db::DbError) -> StoreError {
    move |e| {
        if e.is_not_found() {
            StoreError::NotFound(what)
        } else {
            StoreError::Database(e)
        }
    }
}

fn execution_row(execution: &Execution) -> Result<WorkflowExecutionRow, StoreError> {
    Ok(WorkflowExecutionRow {
        id: execution.id,
        workflow_id: execution.workflow_id,
        workflow_version: execution.workflow_version as i32,
        tenant_id: execution.tenant_id,
        status: execution.status.to_string(),
        trigger_input: execution.trigger_input.clone(),
        step_order: execution.steps.iter().map(|s| s.node_id.clone()).collect(),
        failure: execution.failure.as_ref().map(serde_json::to_value).transpose()?,
        started_at: execution.started_at,
        finished_at: execution.finished_at,
    })
}

fn step_row(execution_id: Uuid, step: &StepExecution) -> NodeExecutionRow {
    NodeExecutionRow {
        execution_id,
        node_id: step.node_id.clone(),
        status: step.status.to_string(),
        attempt: step.attempt as i32,
        output: step.output.clone(),
        error: step.error.clone(),
        started_at: step.started_at,
        finished_at: step.finished_at,
    }
}

fn step_from_row(row: NodeExecutionRow) -> Result<StepExecution, StoreError> {
    Ok(StepExecution {
        status: row.status.parse().map_err(StoreError::Corrupt)?,
        node_id: row.node_id,
        attempt: row.attempt.max(0) as u32,
        output: row.output,
        error: row.error,
        started_at: row.started_at,
        finished_at: row.finished_at,
    })
}

/// Lay saved step records out in plan order. Steps never written yet come
/// back `Pending`; rows outside `order` go last, by node id.
fn steps_in_plan_order(order: &[String], saved: Vec<StepExecution>) -> Vec<StepExecution> {
    let mut saved: HashMap<String, StepExecution> =
        saved.into_iter().map(|s| (s.node_id.clone(), s)).collect();
    let mut steps: Vec<StepExecution> = order
        .iter()
        .map(|node_id| saved.remove(node_id).unwrap_or_else(|| StepExecution::pending(node_id.clone())))
        .collect();
    let mut rest: Vec<StepExecution> = saved.into_values().collect();
    rest.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    steps.extend(rest);
    steps
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn load_workflow_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let row = db::repository::workflows::get_workflow(&self.pool, workflow_id)
            .await
            .map_err(not_found_as(format!("workflow {workflow_id}")))?;
        let mut definition: WorkflowDefinition = serde_json::from_value(row.definition)?;
        // The row is authoritative for identity and version.
        definition.id = row.id;
        definition.version = row.version.max(1) as u32;
        Ok(definition)
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let row = execution_row(execution)?;
        db::repository::executions::upsert_execution(&self.pool, &row).await?;
        Ok(())
    }

    async fn save_step_execution(&self, execution_id: Uuid, step: &StepExecution) -> Result<(), StoreError> {
        db::repository::executions::upsert_node_execution(&self.pool, &step_row(execution_id, step)).await?;
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, StoreError> {
        let row = db::repository::executions::get_execution(&self.pool, execution_id)
            .await
            .map_err(not_found_as(format!("execution {execution_id}")))?;
        let saved = db::repository::executions::list_node_executions(&self.pool, execution_id)
            .await?
            .into_iter()
            .map(step_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let steps = steps_in_plan_order(&row.step_order, saved);

        Ok(Execution {
            id: row.id,
            tenant_id: row.tenant_id,
            workflow_id: row.workflow_id,
            workflow_version: row.workflow_version.max(0) as u32,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            trigger_input: row.trigger_input,
            failure: row.failure.map(serde_json::from_value).transpose()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            steps,
        })
    }
}
