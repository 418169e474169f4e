//! Inbound callbacks from the processing service.

use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use canopy_analysis::CallbackPayload;
use canopy_infra::pipeline::{CallbackOutcome, ProgressOutcome};

use crate::app::errors::pipeline_error_to_response;
use crate::app::services::AppServices;

/// POST /pipeline/callback
///
/// Out-of-order reports are acknowledged with 202 and dropped.
pub async fn callback(
    Extension(services): Extension<Arc<AppServices>>,
    Json(payload): Json<CallbackPayload>,
) -> Response {
    match services.orchestrator.handle_callback(payload).await {
        Ok(CallbackOutcome::Progress(ProgressOutcome::Ignored(reason))) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "ignored", "reason": reason.to_string() })),
        )
            .into_response(),
        Ok(CallbackOutcome::Progress(ProgressOutcome::Applied(_))) => {
            (StatusCode::OK, Json(json!({ "status": "updated" }))).into_response()
        }
        Ok(CallbackOutcome::Completed) => {
            (StatusCode::OK, Json(json!({ "status": "completed" }))).into_response()
        }
        Ok(CallbackOutcome::Failed) => {
            (StatusCode::OK, Json(json!({ "status": "failed" }))).into_response()
        }
        Err(e) => pipeline_error_to_response(e),
    }
}
