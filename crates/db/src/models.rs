//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models - they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    /// Full JSON workflow definition (nodes, edges, trigger, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// tenants
// ---------------------------------------------------------------------------

/// Per-tenant execution limits.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantRow {
    pub id: Uuid,
    pub name: String,
    pub max_concurrent_executions: i32,
    pub max_steps_per_workflow: i32,
}

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// A persisted workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub tenant_id: Uuid,
    pub status: String,
    pub trigger_input: serde_json::Value,
    /// Node ids in plan order; node rows carry no position of their own.
    pub step_order: Vec<String>,
    /// Structured failure reason, present once the execution has failed.
    pub failure: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

/// A persisted node execution row, keyed by `(execution_id, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeExecutionRow {
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: String,
    pub attempt: i32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
