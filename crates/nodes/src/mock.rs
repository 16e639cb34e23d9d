//! `MockNode` - a test double for `ExecutableNode`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{ExecutableNode, ExecutionContext, NodeError};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then
    /// return the value.
    FailThenReturn { failures: u32, value: Value },
    /// Panic inside `execute`.
    Panic(String),
}

/// Shared, ordered log of `start:<name>` / `end:<name>` entries, used to
/// assert on dispatch ordering across several mocks.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    /// Simulated work time before the behaviour is applied.
    pub delay: Option<Duration>,
    journal: Option<Journal>,
    failures_seen: AtomicU32,
}

impl MockNode {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            journal: None,
            failures_seen: AtomicU32::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times, then succeeds.
    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailThenReturn { failures, value })
    }

    /// Create a mock that panics when executed.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Sleep for `delay` on every call before applying the behaviour.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append `start:<name>` / `end:<name>` entries to `journal` on every call.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn note(&self, event: &str) {
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push(format!("{event}:{}", self.name));
        }
    }

    fn output(&self, v: &Value) -> Value {
        // Merge the node's name into its output so tests can trace the data
        // flowing through the graph.
        let mut out = json!({ "node": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(&self, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        self.calls.lock().unwrap().push(input);
        self.note("start");

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::FailThenReturn { failures, value } => {
                let seen = self.failures_seen.fetch_add(1, Ordering::SeqCst);
                if seen < *failures {
                    Err(NodeError::Retryable(format!("flaky failure #{}", seen + 1)))
                } else {
                    Ok(self.output(value))
                }
            }
            MockBehaviour::Panic(msg) => panic!("{msg}"),
        };

        self.note("end");
        result
    }
}
