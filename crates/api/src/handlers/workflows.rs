use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use db::repository::workflows as wf_repo;
use engine::models::AuthenticationType;
use engine::{RegisteredWorkflow, Trigger, WorkflowDefinition};
use serde::Serialize;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub webhook_id: Option<String>,
    /// Node ids in execution order.
    pub steps: Vec<String>,
}

impl From<&RegisteredWorkflow> for WorkflowSummary {
    fn from(registered: &RegisteredWorkflow) -> Self {
        let definition = &registered.definition;
        Self {
            id: definition.id,
            name: definition.name.clone(),
            version: definition.version,
            webhook_id: definition.webhook().map(|w| w.id.clone()),
            steps: registered.plan.step_order().into_iter().map(str::to_owned).collect(),
        }
    }
}

const REDACTED: &str = "[redacted]";

/// The definition as returned to API callers: webhook secrets are masked.
fn redacted(definition: &WorkflowDefinition) -> WorkflowDefinition {
    let mut definition = definition.clone();
    if let Trigger::Webhook(webhook) = &mut definition.trigger {
        match &mut webhook.auth {
            AuthenticationType::None => {}
            AuthenticationType::SharedSecret { secret, .. }
            | AuthenticationType::Signature { secret, .. } => *secret = REDACTED.to_owned(),
        }
    }
    definition
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<WorkflowSummary>> {
    Json(state.engine.workflows().iter().map(WorkflowSummary::from).collect())
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let registered = state
        .engine
        .workflow(id)
        .ok_or_else(|| ApiError::NotFound(format!("workflow {id}")))?;
    Ok(Json(redacted(&registered.definition)))
}

/// Compile, persist, then register. A definition that does not compile is
/// never stored.
pub async fn create(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<WorkflowSummary>), ApiError> {
    state.engine.compile_workflow(&definition)?;

    if let Some(pool) = &state.pool {
        wf_repo::upsert_workflow(
            pool,
            definition.id,
            &definition.name,
            definition.version as i32,
            serde_json::to_value(&definition)?,
        )
        .await?;
    }

    let registered = state.engine.register_workflow(definition)?;
    Ok((StatusCode::CREATED, Json(WorkflowSummary::from(&registered))))
}

pub async fn delete(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    let mut existed = state.engine.unregister_workflow(id);
    if let Some(pool) = &state.pool {
        match wf_repo::delete_workflow(pool, id).await {
            Ok(()) => existed = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    if existed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("workflow {id}")))
    }
}
