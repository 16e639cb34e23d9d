//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The scheduler uses the variant to decide retry behaviour:
/// - `Retryable` - the attempt counts as failed and is retried with
///   exponential back-off while attempts remain.
/// - `Fatal` - the step settles `Failed` immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; the step may be re-attempted.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),

    /// The node's parameters do not match what the node type expects.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

impl NodeError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
