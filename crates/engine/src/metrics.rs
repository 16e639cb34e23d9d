//! Metrics collaborator.
//!
//! Calls are fire-and-forget: implementations must return promptly and
//! must not fail the execution path.

use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::models::{ExecutionStatus, StepStatus};

pub trait MetricsRecorder: Send + Sync {
    fn record_execution_started(&self, tenant_id: Uuid);
    fn record_execution_completed(&self, tenant_id: Uuid, status: ExecutionStatus);
    fn record_step_completed(&self, tenant_id: Uuid, status: StepStatus);
    fn record_execution_duration(&self, tenant_id: Uuid, duration: Duration);
}

/// Emits every measurement as a structured `tracing` event on the
/// `stepwise::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn record_execution_started(&self, tenant_id: Uuid) {
        info!(target: "stepwise::metrics", %tenant_id, "execution_started");
    }

    fn record_execution_completed(&self, tenant_id: Uuid, status: ExecutionStatus) {
        info!(target: "stepwise::metrics", %tenant_id, %status, "execution_completed");
    }

    fn record_step_completed(&self, tenant_id: Uuid, status: StepStatus) {
        info!(target: "stepwise::metrics", %tenant_id, %status, "step_completed");
    }

    fn record_execution_duration(&self, tenant_id: Uuid, duration: Duration) {
        info!(
            target: "stepwise::metrics",
            %tenant_id,
            duration_ms = duration.as_millis() as u64,
            "execution_duration"
        );
    }
}
