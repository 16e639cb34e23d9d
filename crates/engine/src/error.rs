//! Engine-level error types.
//!
//! Compile and admission errors are returned synchronously to the caller.
//! Errors that happen while an execution runs never escape the scheduler;
//! they end up in the execution record instead (see
//! [`FailureReason`](crate::models::FailureReason)).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Reasons a workflow definition cannot be compiled into a plan.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNode(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// The edges form a cycle; `cycle` is one closed example path.
    #[error("workflow graph contains a cycle: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// A node's type has no implementation in the node catalog.
    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType {
        node_id: String,
        node_type: String,
    },
}

/// Reasons a new execution is refused before it starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("no webhook registered under '{0}'")]
    UnknownWebhook(String),

    #[error("webhook authentication failed")]
    AuthenticationFailed,

    #[error("webhook '{webhook_id}' is rate limited; retry in {retry_after:?}")]
    RateLimited {
        webhook_id: String,
        retry_after: Duration,
    },

    #[error("tenant {tenant_id} is at its limit of {limit} concurrent executions")]
    TenantAtCapacity { tenant_id: Uuid, limit: usize },

    #[error("workflow has {steps} steps; tenant limit is {limit}")]
    StepLimitExceeded { steps: usize, limit: usize },
}

impl AdmissionError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownWebhook(_) => "unknown_webhook",
            Self::AuthenticationFailed => "authentication_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::TenantAtCapacity { .. } => "tenant_at_capacity",
            Self::StepLimitExceeded { .. } => "step_limit_exceeded",
        }
    }
}

/// Failures of the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record could not be mapped back onto a domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Database(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Errors surfaced by the [`Engine`](crate::Engine) facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("execution {0} not found")]
    UnknownExecution(Uuid),

    #[error("workflow {0} not found")]
    UnknownWorkflow(Uuid),
}
