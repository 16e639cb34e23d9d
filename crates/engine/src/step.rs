//! Single-step execution.
//!
//! The executor resolves a step's action from the node catalog, runs it on
//! its own task and enforces the attempt deadline carried in the
//! [`ExecutionContext`]. It never retries; that is the scheduler's call.

use std::sync::Arc;

use nodes::{ExecutionContext, NodeCatalog, NodeError};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::PlanStep;

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(Value),
    Failed(NodeError),
    /// The action was still running at the attempt deadline and was dropped.
    TimedOut,
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub message: String,
    pub retryable: bool,
}

impl StepOutcome {
    pub fn into_result(self) -> Result<Value, AttemptFailure> {
        match self {
            Self::Succeeded(output) => Ok(output),
            Self::Failed(e) => Err(AttemptFailure {
                retryable: e.is_retryable(),
                message: e.to_string(),
            }),
            Self::TimedOut => Err(AttemptFailure {
                message: "step timed out".into(),
                retryable: true,
            }),
        }
    }
}

/// The step's node type has no action in the catalog. Treated as an
/// infrastructure failure, not as a failed attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no executor available for node type '{0}'")]
pub struct ExecutorUnavailable(pub String);

#[derive(Debug, Clone)]
pub struct StepExecutor {
    catalog: Arc<NodeCatalog>,
}

impl StepExecutor {
    pub fn new(catalog: Arc<NodeCatalog>) -> Self {
        Self { catalog }
    }

    /// Run one attempt of `step` against `input`, cut off at `ctx.deadline`.
    ///
    /// A panicking action settles as a fatal failure.
    pub async fn run(
        &self,
        step: &PlanStep,
        input: Value,
        ctx: ExecutionContext,
    ) -> Result<StepOutcome, ExecutorUnavailable> {
        let node = self
            .catalog
            .get(&step.node_type)
            .ok_or_else(|| ExecutorUnavailable(step.node_type.clone()))?;

        let deadline = ctx.deadline;
        let mut action = tokio::spawn(async move { node.execute(input, &ctx).await });

        let outcome = match tokio::time::timeout_at(deadline, &mut action).await {
            Ok(Ok(Ok(output))) => StepOutcome::Succeeded(output),
            Ok(Ok(Err(e))) => StepOutcome::Failed(e),
            Ok(Err(join)) => StepOutcome::Failed(NodeError::Fatal(format!("node action aborted: {join}"))),
            Err(_) => {
                action.abort();
                debug!(node_id = %step.node_id, "attempt cut off at deadline");
                StepOutcome::TimedOut
            }
        };
        Ok(outcome)
    }
}
