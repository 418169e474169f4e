//! Pipeline stages and stage-weighted progress.
//!
//! The external processing service reports progress per stage (0–100 within
//! the stage). Overall progress is the weighted sum of every stage already
//! passed plus the weighted share of the current one. Everything in this module
//! is pure: no I/O, no shared state, safe to call from any task.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use canopy_core::DomainError;

/// One named phase of the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    GroundClassification,
    HeightNormalization,
    TreeDetection,
    MetricsExtraction,
    Completed,
    Failed,
}

/// Share of overall progress credited when results are persisted.
pub const FINALIZATION_WEIGHT: f64 = 5.0;

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 7] = [
        Stage::Queued,
        Stage::GroundClassification,
        Stage::HeightNormalization,
        Stage::TreeDetection,
        Stage::MetricsExtraction,
        Stage::Completed,
        Stage::Failed,
    ];

    /// The stages executed by the processing service, in order.
    pub const fn processing_stages() -> [Stage; 4] {
        [
            Stage::GroundClassification,
            Stage::HeightNormalization,
            Stage::TreeDetection,
            Stage::MetricsExtraction,
        ]
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::GroundClassification => "ground_classification",
            Stage::HeightNormalization => "height_normalization",
            Stage::TreeDetection => "tree_detection",
            Stage::MetricsExtraction => "metrics_extraction",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Relative weight of this stage in overall progress.
    pub const fn weight(&self) -> f64 {
        match self {
            Stage::Queued => 0.0,
            Stage::GroundClassification => 20.0,
            Stage::HeightNormalization => 20.0,
            Stage::TreeDetection => 30.0,
            Stage::MetricsExtraction => 25.0,
            Stage::Completed => FINALIZATION_WEIGHT,
            Stage::Failed => 0.0,
        }
    }

    /// Position in the pipeline ordering. `Failed` sorts after everything.
    pub const fn index(&self) -> usize {
        match self {
            Stage::Queued => 0,
            Stage::GroundClassification => 1,
            Stage::HeightNormalization => 2,
            Stage::TreeDetection => 3,
            Stage::MetricsExtraction => 4,
            Stage::Completed => 5,
            Stage::Failed => 6,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub const fn is_processing(&self) -> bool {
        matches!(
            self,
            Stage::GroundClassification
                | Stage::HeightNormalization
                | Stage::TreeDetection
                | Stage::MetricsExtraction
        )
    }

    /// Sum of the weights of all processing stages strictly before this one.
    fn weight_before(&self) -> f64 {
        Stage::processing_stages()
            .iter()
            .take_while(|s| s.index() < self.index())
            .map(Stage::weight)
            .sum()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::unknown_value(format!("stage `{s}`")))
    }
}

/// Map a stage and its own completion percent to overall progress (0–100).
///
/// `stage_percent` is clamped to 0–100. `queued` and `failed` report 0,
/// `completed` reports 100.
pub fn overall_progress(stage: Stage, stage_percent: f64) -> f64 {
    match stage {
        Stage::Queued | Stage::Failed => 0.0,
        Stage::Completed => 100.0,
        processing => {
            let pct = if stage_percent.is_nan() {
                0.0
            } else {
                stage_percent.clamp(0.0, 100.0)
            };
            processing.weight_before() + pct * processing.weight() / 100.0
        }
    }
}

/// Inverse of [`overall_progress`] at stage granularity.
///
/// Used when only the coarse persisted percent survives (cache expired).
/// Boundaries belong to the later stage: 20% is the start of height normalization.
pub fn stage_for_progress(overall: f64) -> Stage {
    if overall.is_nan() || overall <= 0.0 {
        return Stage::Queued;
    }
    if overall >= 100.0 {
        return Stage::Completed;
    }

    let mut upper = 0.0;
    for stage in Stage::processing_stages() {
        upper += stage.weight();
        if overall < upper {
            return stage;
        }
    }
    // Inside the finalization share.
    Stage::MetricsExtraction
}

/// Linear completion estimate.
///
/// Extrapolates the elapsed time since `started_at` to 100%. Returns `None`
/// while nothing has been reported yet (`overall <= 0`).
pub fn estimate_completion(
    started_at: DateTime<Utc>,
    overall: f64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if overall.is_nan() || overall <= 0.0 {
        return None;
    }
    if overall >= 100.0 {
        return Some(now);
    }

    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
    let remaining_ms = elapsed_ms * (100.0 / overall) - elapsed_ms;
    Some(now + Duration::milliseconds(remaining_ms.round() as i64))
}
