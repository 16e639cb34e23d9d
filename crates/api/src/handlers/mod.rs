pub mod executions;
pub mod health;
pub mod webhooks;
pub mod workflows;

use serde::Serialize;
use uuid::Uuid;

/// Body of every 202 response that starts or touches an execution.
#[derive(Debug, Serialize)]
pub struct Accepted {
    pub execution_id: Uuid,
}
