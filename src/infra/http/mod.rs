//! HTTP surface: multipart uploads in, artifact JSON and streamed downloads out.

pub mod error;
mod export;
mod generate;
mod middleware;
mod multipart;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::{
    export::ExportService, generate::GenerationService, validate::UploadLimits,
};

pub use generate::{ModelBody, TaskResultBody, TaskStatusBody};
pub use middleware::RequestContext;

#[derive(Clone)]
pub struct AppState {
    pub export: Arc<ExportService>,
    pub generation: Arc<GenerationService>,
    pub limits: UploadLimits,
}

impl AppState {
    pub fn new(export: ExportService, generation: GenerationService, limits: UploadLimits) -> Self {
        Self {
            export: Arc::new(export),
            generation: Arc::new(generation),
            limits,
        }
    }
}

/// Build the API router. `body_limit` caps a whole multipart request.
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/api/export/retarget", post(export::retarget))
        .route("/api/export/autorig", post(export::auto_rig))
        .route("/api/export/sprint", post(export::sprint))
        .route("/api/export/download/{filename}", get(export::download))
        .route("/api/ai/generate", post(generate::generate))
        .route("/api/ai/status/{task_id}", get(generate::status))
        .route("/api/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
