//! Lifecycle events handed to the message-bus collaborator.
//!
//! Publishing is best-effort: a publisher must not block, and a failed
//! publish is the publisher's concern, never the scheduler's.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ExecutionStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    pub execution_id: Uuid,
    pub tenant_id: Uuid,
    pub node_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Execution(ExecutionEvent),
    Step(StepEvent),
}

pub trait EventPublisher: Send + Sync {
    fn publish_execution_event(&self, event: ExecutionEvent);
    fn publish_step_event(&self, event: StepEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish_execution_event(&self, _event: ExecutionEvent) {}
    fn publish_step_event(&self, _event: StepEvent) {}
}

/// Fans events out to any number of in-process subscribers.
///
/// Sending never blocks; with no subscriber the event is dropped, and slow
/// subscribers observe `Lagged` rather than slowing the engine down.
#[derive(Debug, Clone)]
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastEventPublisher {
    fn publish_execution_event(&self, event: ExecutionEvent) {
        let _ = self.sender.send(EngineEvent::Execution(event));
    }

    fn publish_step_event(&self, event: StepEvent) {
        let _ = self.sender.send(EngineEvent::Step(event));
    }
}
