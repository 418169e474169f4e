//! `/jobs` queue introspection.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use canopy_analysis::ANALYSIS_QUEUE;
use canopy_infra::jobs::JobId;

use crate::app::dto::{JobView, ListJobsQuery};
use crate::app::errors::{json_error, queue_error_to_response};
use crate::app::services::AppServices;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// GET /jobs?state=&limit=
pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match services
        .queue
        .store()
        .list_by_state(ANALYSIS_QUEUE, query.state, limit)
        .await
    {
        Ok(jobs) => {
            let views: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
            (StatusCode::OK, Json(views)).into_response()
        }
        Err(e) => queue_error_to_response(e),
    }
}

/// GET /jobs/stats
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.queue.stats(ANALYSIS_QUEUE).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => queue_error_to_response(e),
    }
}

/// GET /jobs/:job_id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = JobId::new(job_id);
    match services.queue.get_job(&job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(JobView::from(job))).into_response(),
        Ok(None) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {job_id} not found"),
        ),
        Err(e) => queue_error_to_response(e),
    }
}
