//! Live progress notifications fanned out to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use canopy_core::AnalysisId;

use crate::progress::ProgressRecord;
use crate::stage::Stage;

/// Event published on an analysis' channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        analysis_id: AnalysisId,
        stage: Stage,
        progress: f64,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        analysis_id: AnalysisId,
        stage: Stage,
        progress: f64,
        message: String,
        results: JsonValue,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        analysis_id: AnalysisId,
        stage: Stage,
        progress: f64,
        message: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn progress(record: &ProgressRecord) -> Self {
        Self::Progress {
            analysis_id: record.analysis_id,
            stage: record.stage,
            progress: record.progress,
            message: record.message.clone(),
            timestamp: record.updated_at,
        }
    }

    pub fn complete(record: &ProgressRecord, results: JsonValue) -> Self {
        Self::Complete {
            analysis_id: record.analysis_id,
            stage: record.stage,
            progress: record.progress,
            message: record.message.clone(),
            results,
            timestamp: record.updated_at,
        }
    }

    pub fn error(record: &ProgressRecord, error: impl Into<String>) -> Self {
        Self::Error {
            analysis_id: record.analysis_id,
            stage: record.stage,
            progress: record.progress,
            message: record.message.clone(),
            error: error.into(),
            timestamp: record.updated_at,
        }
    }

    pub fn analysis_id(&self) -> AnalysisId {
        match self {
            ProgressEvent::Progress { analysis_id, .. }
            | ProgressEvent::Complete { analysis_id, .. }
            | ProgressEvent::Error { analysis_id, .. } => *analysis_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }

    /// No further events follow this one for the current run.
    pub fn is_final(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}
