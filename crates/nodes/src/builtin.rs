//! Built-in node types available to every workflow.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{ExecutableNode, ExecutionContext, NodeError};

/// `passthrough` - returns its input unchanged.
pub struct PassthroughNode;

#[async_trait]
impl ExecutableNode for PassthroughNode {
    async fn execute(&self, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        Ok(input)
    }
}

/// `set` - merges the `values` object parameter into the input object.
///
/// A `null` input is treated as an empty object; any other non-object input
/// is rejected.
pub struct SetNode;

#[async_trait]
impl ExecutableNode for SetNode {
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let values = ctx
            .parameters
            .get("values")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeError::InvalidParameters("`values` must be an object".into()))?;

        let mut out = match input {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(NodeError::Fatal(format!(
                    "set expects an object input, got {other}"
                )))
            }
        };
        for (k, v) in values {
            out.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(out))
    }
}

/// `delay` - sleeps for the `ms` parameter, then returns its input.
pub struct DelayNode;

#[async_trait]
impl ExecutableNode for DelayNode {
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let ms = ctx
            .parameters
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| NodeError::InvalidParameters("`ms` must be a non-negative integer".into()))?;
        debug!(node_id = %ctx.node_id, ms, "delay node sleeping");
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(input)
    }
}
