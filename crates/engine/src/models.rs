//! Core domain models for the workflow engine.
//!
//! Three families live here:
//! - the authored [`WorkflowDefinition`] (serialised to/from the JSONB
//!   `definition` column of the `workflows` table),
//! - the immutable [`CompiledPlan`] produced from it by the compiler,
//! - the runtime [`Execution`] / [`StepExecution`] records owned by the
//!   scheduler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RetryPolicy;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// How a workflow is started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Triggered directly through the engine API.
    #[default]
    Manual,
    /// Triggered by an incoming HTTP request to `/webhook/{id}`.
    Webhook(WebhookConfig),
}

/// Webhook binding of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL path segment that identifies this webhook.
    pub id: String,
    /// Tenant every execution started through this webhook is billed to.
    pub tenant_id: Uuid,
    #[serde(default)]
    pub auth: AuthenticationType,
    #[serde(default)]
    pub rate_limit: RateLimit,
}

/// How a webhook request proves it is allowed to start the workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthenticationType {
    #[default]
    None,
    /// The named header must carry exactly `secret`.
    SharedSecret {
        #[serde(default = "default_secret_header")]
        header: String,
        secret: String,
    },
    /// The named header must carry the hex HMAC-SHA256 of the raw body keyed
    /// with `secret`, optionally prefixed with `sha256=`.
    Signature {
        #[serde(default = "default_signature_header")]
        header: String,
        secret: String,
    },
}

fn default_secret_header() -> String {
    "x-webhook-secret".into()
}

fn default_signature_header() -> String {
    "x-signature-256".into()
}

/// Fixed-window admission limit of a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Admissions allowed per window.
    pub limit: u32,
    pub window_secs: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { limit: 60, window_secs: 60 }
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Maps to an `ExecutableNode` registered in the node catalog.
    pub node_type: String,
    /// Opaque configuration handed to the node at execution time.
    #[serde(default, alias = "config")]
    pub parameters: Value,
    /// Overrides the workflow's retry policy for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the workflow's step timeout for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// A tolerant node's failure neither fails the execution nor skips its
    /// downstream nodes.
    #[serde(default)]
    pub tolerant: bool,
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// When set, the downstream node receives only this key of the upstream
    /// node's output object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_slot: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into(), output_slot: None }
    }
}

/// Workflow-wide execution settings. Unset fields fall back to the engine
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
}

/// A complete, authored workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    /// Bumped whenever the definition changes; part of the plan cache key.
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub trigger: Trigger,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Convenience constructor for tests and tooling.
    pub fn new(name: impl Into<String>, nodes: Vec<NodeSpec>, edges: Vec<Edge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            trigger: Trigger::Manual,
            nodes,
            edges,
            settings: WorkflowSettings::default(),
            created_at: Utc::now(),
        }
    }

    pub fn webhook(&self) -> Option<&WebhookConfig> {
        match &self.trigger {
            Trigger::Webhook(config) => Some(config),
            Trigger::Manual => None,
        }
    }
}

impl NodeSpec {
    /// A node of `node_type` with no parameters and inherited policies.
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            parameters: Value::Null,
            retry: None,
            timeout_ms: None,
            tolerant: false,
        }
    }
}

// ---------------------------------------------------------------------------
// CompiledPlan
// ---------------------------------------------------------------------------

/// An upstream dependency of a plan step.
#[derive(Debug, Clone, Serialize)]
pub struct Upstream {
    pub node_id: String,
    /// Position of the upstream step in [`CompiledPlan::steps`].
    pub index: usize,
    pub output_slot: Option<String>,
}

/// One node, resolved and positioned in topological order.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Position in [`CompiledPlan::steps`]; also the dispatch tie-breaker.
    pub index: usize,
    pub node_id: String,
    pub node_type: String,
    pub parameters: Value,
    /// Dependencies, ordered by their topological position.
    pub upstream: Vec<Upstream>,
    /// Indices of the steps consuming this step's output, ascending.
    pub downstream: Vec<usize>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub tolerant: bool,
}

/// The validated, immutable execution form of a [`WorkflowDefinition`].
///
/// Only the compiler constructs plans, so every plan is acyclic and every
/// edge references an existing step.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledPlan {
    pub workflow_id: Uuid,
    pub version: u32,
    pub steps: Vec<PlanStep>,
    /// Steps without inbound edges, in topological order.
    pub entry_nodes: Vec<String>,
    /// Per-execution ceiling on concurrently running steps.
    pub max_concurrency: usize,
}

impl CompiledPlan {
    pub fn step(&self, node_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }

    /// Node ids in execution order.
    pub fn step_order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.node_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Lifecycle of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Whether the step has reached a final state.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Ready     => write!(f, "ready"),
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
            Self::Skipped   => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "ready"     => Ok(Self::Ready),
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "skipped"   => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Why an execution settled `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// A non-tolerant step failed after exhausting its attempts.
    StepFailed { node_id: String, message: String },
    /// Persistence or executor dispatch kept failing after scheduler retries.
    InfrastructureError { message: String },
    /// The overall execution deadline passed.
    ExecutionTimeout,
}

/// One node's execution within an [`Execution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub node_id: String,
    pub status: StepStatus,
    /// Attempts made so far (0 until first dispatched).
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Present iff `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: StepStatus::Pending,
            attempt: 0,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One run of a [`CompiledPlan`] for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub trigger_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Step records in plan order.
    pub steps: Vec<StepExecution>,
}

impl Execution {
    /// A `Pending` execution with one `Pending` step record per plan step.
    pub fn new(plan: &CompiledPlan, tenant_id: Uuid, trigger_input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_id: plan.workflow_id,
            workflow_version: plan.version,
            status: ExecutionStatus::Pending,
            trigger_input,
            failure: None,
            started_at: None,
            finished_at: None,
            steps: plan.steps.iter().map(|s| StepExecution::pending(&s.node_id)).collect(),
        }
    }

    pub fn step(&self, node_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }
}
