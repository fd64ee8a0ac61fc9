//! Router assembly.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/backups/jobs", post(handlers::create_job))
        .route("/api/backups/jobs", get(handlers::list_jobs))
        .route("/api/backups/jobs/:id", get(handlers::job_detail))
        .route(
            "/api/backups/device/:id/history",
            get(handlers::device_history),
        )
        .route("/api/backups/diff/:id", get(handlers::result_diff))
        .route("/ws/job/:id", get(ws::job_progress))
        .with_state(state)
        .layer(CorsLayer::permissive())
}
