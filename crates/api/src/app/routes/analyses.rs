//! `/analyses/:id/*` handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use canopy_core::AnalysisId;

use crate::app::dto::{
    CancelResponse, PendingResultsResponse, StartAnalysisRequest, StartAnalysisResponse,
};
use crate::app::errors::{json_error, pipeline_error_to_response};
use crate::app::services::{self, AppServices};
use crate::context::UserContext;

fn parse_id(raw: &str) -> Result<AnalysisId, Response> {
    raw.parse::<AnalysisId>().map_err(|e| {
        json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
    })
}

/// POST /analyses/:id/start
pub async fn start(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
    Json(body): Json<StartAnalysisRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .orchestrator
        .start_pipeline(id, body.files, body.parameters, user.user_id())
        .await
    {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(StartAnalysisResponse {
                job_id: job_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}

/// GET /analyses/:id/progress
///
/// 200 once the run is finished, 202 while it is queued or running.
pub async fn progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.get_progress(id).await {
        Ok(record) => {
            let status = if record.stage.is_terminal() {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (status, Json(record)).into_response()
        }
        Err(e) => pipeline_error_to_response(e),
    }
}

/// GET /analyses/:id/results
pub async fn results(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.get_results(id).await {
        Ok(Some(results)) => (StatusCode::OK, Json(results)).into_response(),
        Ok(None) => match services.orchestrator.get_progress(id).await {
            Ok(record) if !record.stage.is_terminal() => (
                StatusCode::ACCEPTED,
                Json(PendingResultsResponse {
                    status: "processing",
                    progress: record,
                }),
            )
                .into_response(),
            Ok(record) => json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no results for analysis {id}: {}", record.message),
            ),
            Err(e) => pipeline_error_to_response(e),
        },
        Err(e) => pipeline_error_to_response(e),
    }
}

/// POST /analyses/:id/cancel
pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    tracing::info!(analysis_id = %id, user_id = %user.user_id(), "cancel requested");
    match services.orchestrator.cancel_processing(id).await {
        Ok(cancelled) => (StatusCode::OK, Json(CancelResponse { cancelled })).into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}

/// GET /analyses/:id/events (Server-Sent Events)
pub async fn events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services::analysis_sse_stream(services, id).await {
        Ok(sse) => sse.into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}
