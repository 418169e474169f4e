use axum::{
    Router,
    routing::{get, post},
};

use crate::middleware;

pub mod analyses;
pub mod jobs;
pub mod pipeline;
pub mod system;

/// Endpoints used by the UI (progress polling, SSE, start/cancel).
pub fn analyses_router() -> Router {
    let mutating = Router::new()
        .route("/:id/start", post(analyses::start))
        .route("/:id/cancel", post(analyses::cancel))
        .layer(axum::middleware::from_fn(middleware::user_middleware));

    Router::new()
        .route("/:id/progress", get(analyses::progress))
        .route("/:id/results", get(analyses::results))
        .route("/:id/events", get(analyses::events))
        .merge(mutating)
}

/// Queue introspection.
pub fn jobs_router() -> Router {
    Router::new()
        .route("/", get(jobs::list))
        .route("/stats", get(jobs::stats))
        .route("/:job_id", get(jobs::get_job))
}
