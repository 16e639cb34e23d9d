use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::Execution;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::Accepted;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowDto {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub input: Value,
}

pub async fn execute(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ExecuteWorkflowDto>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let execution_id = state
        .engine
        .start_workflow(id, payload.tenant_id, payload.input)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { execution_id })))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Execution>, ApiError> {
    Ok(Json(state.engine.get_execution_status(id).await?))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    state.engine.cancel_execution(id).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { execution_id: id })))
}
