//! `api` crate - HTTP REST API over the workflow engine.
//!
//! Exposes:
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows
//!   GET    /api/v1/workflows/{id}
//!   DELETE /api/v1/workflows/{id}
//!   POST   /api/v1/workflows/{id}/execute
//!   GET    /api/v1/executions/{id}
//!   POST   /api/v1/executions/{id}/cancel
//!   POST   /api/v1/webhook/{webhook_id}

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use db::DbPool;
use engine::Engine;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;

/// Shared handler state.
///
/// Without a pool, workflows live only in the engine's registry.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub pool: Option<DbPool>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, pool: Option<DbPool>) -> Self {
        Self { engine, pool }
    }
}

pub fn router(state: AppState) -> Router {
    use handlers::{executions, health, webhooks, workflows};

    Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/workflows", get(workflows::list).post(workflows::create))
        .route("/api/v1/workflows/{id}", get(workflows::get).delete(workflows::delete))
        .route("/api/v1/workflows/{id}/execute", post(executions::execute))
        .route("/api/v1/executions/{id}", get(executions::get))
        .route("/api/v1/executions/{id}/cancel", post(executions::cancel))
        .route("/api/v1/webhook/{webhook_id}", post(webhooks::handle_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `bind` until Ctrl-C.
pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
}
