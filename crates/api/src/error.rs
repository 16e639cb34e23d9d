//! Mapping of engine and persistence errors onto HTTP responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::{AdmissionError, EngineError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),
}

impl From<engine::CompileError> for ApiError {
    fn from(e: engine::CompileError) -> Self {
        Self::Engine(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Engine(EngineError::Compile(_)) => StatusCode::BAD_REQUEST,
            Self::Engine(EngineError::Admission(e)) => match e {
                AdmissionError::UnknownWebhook(_) => StatusCode::NOT_FOUND,
                AdmissionError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
                AdmissionError::RateLimited { .. } | AdmissionError::TenantAtCapacity { .. } => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                AdmissionError::StepLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            },
            Self::Engine(EngineError::UnknownExecution(_) | EngineError::UnknownWorkflow(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(EngineError::Store(_)) | Self::Database(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Engine(EngineError::Admission(e)) => Some(e.reason()),
            Self::Engine(EngineError::Compile(_)) => Some("invalid_workflow"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "reason": self.reason(),
            "status": status.as_u16(),
        }));
        let mut response = (status, body).into_response();

        if let Self::Engine(EngineError::Admission(AdmissionError::RateLimited { retry_after, .. })) = &self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
