//! Queue job payload and the inbound callback contract.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use canopy_core::{AnalysisId, FileId, ProjectId, UserId};

use crate::progress::ProgressUpdate;
use crate::stage::Stage;

/// Queue the pipeline jobs are published on.
pub const ANALYSIS_QUEUE: &str = "analysis";

/// Job name of a full pipeline run.
pub const FULL_PIPELINE_JOB: &str = "full-pipeline";

/// Deterministic job id for an analysis: re-enqueueing the same run hits the same id.
pub fn pipeline_job_id(analysis_id: AnalysisId) -> String {
    format!("analysis-{analysis_id}")
}

/// A point-cloud file handed to the processing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    pub file_id: FileId,
    pub storage_path: String,
    pub file_type: String,
}

/// Payload of an `analysis/full-pipeline` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineJobPayload {
    pub analysis_id: AnalysisId,
    pub file_ids: Vec<FileId>,
    pub files: Vec<InputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub user_id: UserId,
    #[serde(default)]
    pub parameters: JsonValue,
}

impl PipelineJobPayload {
    pub fn new(
        analysis_id: AnalysisId,
        files: Vec<InputFile>,
        project_id: Option<ProjectId>,
        user_id: UserId,
        parameters: JsonValue,
    ) -> Self {
        Self {
            analysis_id,
            file_ids: files.iter().map(|f| f.file_id).collect(),
            files,
            project_id,
            user_id,
            parameters,
        }
    }
}

/// Body of `POST /pipeline/callback`, sent by the processing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub analysis_id: AnalysisId,
    pub stage: Stage,
    /// Completion of `stage` (0–100).
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_results: Option<JsonValue>,
}

impl CallbackPayload {
    pub fn to_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            stage: self.stage,
            stage_progress: self.progress,
            message: self.message.clone(),
            intermediate_results: self.intermediate_results.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_is_deterministic() {
        let id = AnalysisId::new();
        assert_eq!(pipeline_job_id(id), pipeline_job_id(id));
        assert!(pipeline_job_id(id).starts_with("analysis-"));
    }

    #[test]
    fn callback_rejects_unknown_stage() {
        let body = json!({
            "analysisId": AnalysisId::new(),
            "stage": "voxelization",
            "progress": 10,
        });
        assert!(serde_json::from_value::<CallbackPayload>(body).is_err());
    }

    #[test]
    fn callback_parses_wire_format() {
        let id = AnalysisId::new();
        let body = json!({
            "analysisId": id,
            "stage": "tree_detection",
            "progress": 35.5,
            "message": "segmenting crowns",
            "intermediateResults": {"treesSoFar": 40},
        });
        let cb: CallbackPayload = serde_json::from_value(body).unwrap();
        let update = cb.to_update();

        assert_eq!(cb.analysis_id, id);
        assert_eq!(update.stage, Stage::TreeDetection);
        assert_eq!(update.stage_progress, 35.5);
        assert_eq!(update.intermediate_results, Some(json!({"treesSoFar": 40})));
    }

    #[test]
    fn payload_collects_file_ids() {
        let file = InputFile {
            file_id: FileId::new(),
            storage_path: "uploads/a.laz".into(),
            file_type: "laz".into(),
        };
        let p = PipelineJobPayload::new(AnalysisId::new(), vec![file.clone()], None, UserId::new(), json!({}));
        assert_eq!(p.file_ids, vec![file.file_id]);
    }
}
