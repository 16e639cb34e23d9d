//! The `ExecutableNode` trait - the contract every node must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::NodeError;

/// Per-attempt context passed to a node.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the workflow the plan was compiled from.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// Tenant the execution belongs to.
    pub tenant_id: Uuid,
    /// ID of the node being executed.
    pub node_id: String,
    /// The node's opaque parameters, validated lazily by the node itself.
    pub parameters: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Hard deadline for this attempt. The executor cuts the node off here.
    pub deadline: Instant,
}

/// The core node trait.
///
/// Implementations must be stateless across calls with respect to the
/// execution: everything they need arrives through `input` and `ctx`.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node against its resolved `input` and return this node's
    /// JSON output.
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError>;
}
