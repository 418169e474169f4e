//! The Progress Record: cached, mutable snapshot of a running analysis.
//!
//! Updates go through [`ProgressRecord::apply`], which enforces that progress
//! never moves backwards while the run is live. Callbacks from the processing
//! service are trusted for content but not for ordering: a callback naming an
//! earlier stage, a lower percent within the same stage, or arriving after the
//! run reached a terminal stage is rejected instead of rewinding the record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use canopy_core::AnalysisId;

use crate::stage::{Stage, estimate_completion, overall_progress};

/// A progress report for one analysis, as received from the processing service.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    /// Completion of `stage` itself (0–100).
    pub stage_progress: f64,
    pub message: String,
    pub intermediate_results: Option<JsonValue>,
}

impl ProgressUpdate {
    pub fn new(stage: Stage, stage_progress: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            stage_progress,
            message: message.into(),
            intermediate_results: None,
        }
    }

    pub fn with_intermediate_results(mut self, results: JsonValue) -> Self {
        self.intermediate_results = Some(results);
        self
    }
}

/// Why an update was not applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpdateRejected {
    #[error("run already reached terminal stage {current}")]
    AfterTerminal { current: Stage },

    #[error("stage {attempted} is before current stage {current}")]
    StageRewind { current: Stage, attempted: Stage },

    #[error("{stage} progress {attempted} is below current {current}")]
    PercentRewind {
        stage: Stage,
        current: f64,
        attempted: f64,
    },

    #[error("terminal stage {0} cannot be reported as progress")]
    TerminalStage(Stage),
}

/// Outcome of a successfully applied update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTransition {
    pub previous_stage: Stage,
    pub previous_progress: f64,
    pub progress: f64,
    pub stage_changed: bool,
    /// The overall percent entered a new 10% bucket.
    pub decile_crossed: bool,
}

impl ProgressTransition {
    /// Whether this transition warrants a write to the system of record.
    pub fn should_persist(&self) -> bool {
        self.stage_changed || self.decile_crossed
    }
}

/// Cached progress state, keyed by analysis id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub analysis_id: AnalysisId,
    pub stage: Stage,
    pub stage_progress: f64,
    /// Overall percent (0–100).
    pub progress: f64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Wall-clock time each stage was first observed, keyed by stage name.
    #[serde(default)]
    pub stage_start_times: BTreeMap<String, DateTime<Utc>>,
    /// Seconds spent in each finished stage, keyed by stage name.
    #[serde(default)]
    pub stage_durations: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_results: Option<JsonValue>,
}

impl ProgressRecord {
    /// Fresh record for a run that was just enqueued.
    pub fn queued(analysis_id: AnalysisId, now: DateTime<Utc>) -> Self {
        let mut stage_start_times = BTreeMap::new();
        stage_start_times.insert(Stage::Queued.as_str().to_string(), now);

        Self {
            analysis_id,
            stage: Stage::Queued,
            stage_progress: 0.0,
            progress: 0.0,
            message: "Analysis queued".to_string(),
            started_at: now,
            updated_at: now,
            estimated_completion: None,
            stage_start_times,
            stage_durations: BTreeMap::new(),
            intermediate_results: None,
        }
    }

    /// Apply a progress update, refusing anything that would move the record backwards.
    pub fn apply(
        &mut self,
        update: ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<ProgressTransition, UpdateRejected> {
        if self.stage.is_terminal() {
            return Err(UpdateRejected::AfterTerminal {
                current: self.stage,
            });
        }
        if update.stage.is_terminal() {
            return Err(UpdateRejected::TerminalStage(update.stage));
        }
        if update.stage.index() < self.stage.index() {
            return Err(UpdateRejected::StageRewind {
                current: self.stage,
                attempted: update.stage,
            });
        }

        let stage_progress = update.stage_progress.clamp(0.0, 100.0);
        if update.stage == self.stage && stage_progress < self.stage_progress {
            return Err(UpdateRejected::PercentRewind {
                stage: self.stage,
                current: self.stage_progress,
                attempted: stage_progress,
            });
        }

        let previous_stage = self.stage;
        let previous_progress = self.progress;
        let stage_changed = update.stage != previous_stage;

        if stage_changed {
            self.close_stage(now);
            self.stage_start_times
                .entry(update.stage.as_str().to_string())
                .or_insert(now);
        }

        let progress = overall_progress(update.stage, stage_progress);

        self.stage = update.stage;
        self.stage_progress = stage_progress;
        self.progress = progress;
        self.message = update.message;
        self.updated_at = now;
        self.estimated_completion = estimate_completion(self.started_at, progress, now);
        if update.intermediate_results.is_some() {
            self.intermediate_results = update.intermediate_results;
        }

        Ok(ProgressTransition {
            previous_stage,
            previous_progress,
            progress,
            stage_changed,
            decile_crossed: decile(progress) > decile(previous_progress),
        })
    }

    /// Move to `completed` (100%).
    pub fn complete(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.stage != Stage::Completed {
            self.close_stage(now);
            self.stage_start_times
                .entry(Stage::Completed.as_str().to_string())
                .or_insert(now);
        }
        self.stage = Stage::Completed;
        self.stage_progress = 100.0;
        self.progress = 100.0;
        self.message = message.into();
        self.updated_at = now;
        self.estimated_completion = None;
    }

    /// Move to `failed`. Repeating the call only refreshes the message.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.stage != Stage::Failed {
            self.close_stage(now);
            self.stage_start_times
                .entry(Stage::Failed.as_str().to_string())
                .or_insert(now);
        }
        self.stage = Stage::Failed;
        self.message = message.into();
        self.updated_at = now;
        self.estimated_completion = None;
    }

    /// Seconds elapsed since the run started.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Record how long the current stage ran.
    fn close_stage(&mut self, now: DateTime<Utc>) {
        let key = self.stage.as_str();
        if let Some(started) = self.stage_start_times.get(key) {
            let secs = (now - *started).num_milliseconds().max(0) as f64 / 1000.0;
            self.stage_durations.insert(key.to_string(), secs);
        }
    }
}

fn decile(progress: f64) -> u8 {
    (progress.clamp(0.0, 100.0) / 10.0).floor() as u8
}
