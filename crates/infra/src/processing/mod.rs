//! Outbound protocol with the external LiDAR processing service.
//!
//! The service either answers synchronously with final results, or
//! acknowledges the request and reports progress through callbacks to
//! `callbackUrl` until it posts a terminal stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use canopy_analysis::InputFile;
use canopy_core::AnalysisId;

use crate::config::StorageConfig;

pub mod http;

pub use http::HttpProcessingClient;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub analysis_id: AnalysisId,
    pub files: Vec<InputFile>,
    pub parameters: JsonValue,
    pub callback_url: String,
    pub storage_config: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_files: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResponse {
    /// Final results delivered inline, if any.
    pub fn synchronous_results(&self) -> Option<&JsonValue> {
        self.results.as_ref().filter(|r| !r.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessingError {
    /// Non-2xx status, `success: false`, or a transport failure (no status).
    #[error("processing service error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ExternalService { status: Option<u16>, message: String },

    #[error("processing request cancelled")]
    Cancelled,
}

impl ProcessingError {
    pub fn external(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            status,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ProcessingService: Send + Sync {
    /// Submit a run. Returns `ProcessingError::Cancelled` as soon as `cancel` fires.
    async fn run_pipeline(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineResponse, ProcessingError>;
}
