use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use canopy_infra::jobs::JobStoreError;
use canopy_infra::pipeline::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::EntityNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("analysis {id} not found"),
        ),
        PipelineError::InvalidState(msg) => json_error(StatusCode::CONFLICT, "invalid_state", msg),
        PipelineError::ExternalService { message, .. } => {
            json_error(StatusCode::BAD_GATEWAY, "external_service_error", message)
        }
        PipelineError::CacheUnavailable(e) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "cache_unavailable",
            e.to_string(),
        ),
        PipelineError::CancelledByUser(id) => json_error(
            StatusCode::CONFLICT,
            "cancelled",
            format!("analysis {id} was cancelled"),
        ),
        PipelineError::Repository(e) => {
            tracing::error!(error = %e, "repository failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "repository_error", e.to_string())
        }
        PipelineError::Queue(e) => queue_error_to_response(e),
    }
}

pub fn queue_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobStoreError::InvalidState { job_id, state } => json_error(
            StatusCode::CONFLICT,
            "invalid_state",
            format!("job {job_id} is {state}"),
        ),
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
