//! Execution and node-execution repository functions.
//!
//! Both tables are written with upserts: the engine saves a record at every
//! state transition, so the latest write wins.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{WorkflowExecutionRow, NodeExecutionRow},
};

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// Insert or update a workflow execution record.
pub async fn upsert_execution(pool: &PgPool, row: &WorkflowExecutionRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_executions
            (id, workflow_id, workflow_version, tenant_id, status, trigger_input, step_order, failure, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                failure = EXCLUDED.failure,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_id)
    .bind(row.workflow_version)
    .bind(row.tenant_id)
    .bind(&row.status)
    .bind(&row.trigger_input)
    .bind(&row.step_order)
    .bind(&row.failure)
    .bind(row.started_at)
    .bind(row.finished_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a workflow execution by its primary key.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<WorkflowExecutionRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowExecutionRow>(
        r#"
        SELECT id, workflow_id, workflow_version, tenant_id, status, trigger_input, step_order, failure, started_at, finished_at
        FROM workflow_executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

/// Insert or update a node execution record.
pub async fn upsert_node_execution(pool: &PgPool, row: &NodeExecutionRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO node_executions
            (execution_id, node_id, status, attempt, output, error, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (execution_id, node_id) DO UPDATE
            SET status = EXCLUDED.status,
                attempt = EXCLUDED.attempt,
                output = EXCLUDED.output,
                error = EXCLUDED.error,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(row.execution_id)
    .bind(&row.node_id)
    .bind(&row.status)
    .bind(row.attempt)
    .bind(&row.output)
    .bind(&row.error)
    .bind(row.started_at)
    .bind(row.finished_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// All node execution records of one execution.
pub async fn list_node_executions(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<NodeExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, NodeExecutionRow>(
        r#"
        SELECT execution_id, node_id, status, attempt, output, error, started_at, finished_at
        FROM node_executions
        WHERE execution_id = $1
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
