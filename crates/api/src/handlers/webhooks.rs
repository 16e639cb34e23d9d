use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use engine::WebhookRequest;

use super::Accepted;
use crate::{ApiError, AppState};

/// Hand the raw request to the engine's admission path. The body is not
/// parsed here; signatures are computed over the exact bytes received.
pub async fn handle_webhook(
    Path(webhook_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let request = WebhookRequest::new(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        body.to_vec(),
        Utc::now(),
    );
    let execution_id = state.engine.trigger_webhook(&webhook_id, &request).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { execution_id })))
}
