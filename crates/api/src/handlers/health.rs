use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::{ApiError, AppState};

pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if let Some(pool) = &state.pool {
        db::pool::ping(pool).await?;
    }
    Ok(Json(json!({ "status": "ok" })))
}
