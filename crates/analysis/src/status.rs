//! Status of an analysis in the system of record.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use canopy_core::DomainError;

use crate::stage::{Stage, stage_for_progress};

/// Durable status column of an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AnalysisStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "PENDING",
            AnalysisStatus::Processing => "PROCESSING",
            AnalysisStatus::Completed => "COMPLETED",
            AnalysisStatus::Failed => "FAILED",
            AnalysisStatus::Cancelled => "CANCELLED",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Cancelled
        )
    }

    /// Normalise to a pipeline stage when only the persisted snapshot is available.
    ///
    /// A `PROCESSING` row only carries a coarse percent, so the stage is
    /// recovered from it.
    pub fn to_stage(&self, persisted_progress: f64) -> Stage {
        match self {
            AnalysisStatus::Pending => Stage::Queued,
            AnalysisStatus::Processing => match stage_for_progress(persisted_progress) {
                Stage::Completed => Stage::MetricsExtraction,
                stage => stage,
            },
            AnalysisStatus::Completed => Stage::Completed,
            AnalysisStatus::Failed | AnalysisStatus::Cancelled => Stage::Failed,
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AnalysisStatus::Pending),
            "PROCESSING" => Ok(AnalysisStatus::Processing),
            "COMPLETED" => Ok(AnalysisStatus::Completed),
            "FAILED" => Ok(AnalysisStatus::Failed),
            "CANCELLED" => Ok(AnalysisStatus::Cancelled),
            other => Err(DomainError::unknown_value(format!("analysis status `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_maps_to_stage() {
        assert_eq!(AnalysisStatus::Pending.to_stage(0.0), Stage::Queued);
        assert_eq!(AnalysisStatus::Processing.to_stage(45.0), Stage::TreeDetection);
        assert_eq!(AnalysisStatus::Processing.to_stage(0.0), Stage::Queued);
        assert_eq!(AnalysisStatus::Processing.to_stage(100.0), Stage::MetricsExtraction);
        assert_eq!(AnalysisStatus::Completed.to_stage(100.0), Stage::Completed);
        assert_eq!(AnalysisStatus::Cancelled.to_stage(30.0), Stage::Failed);
    }

    #[test]
    fn parses_database_names() {
        for s in [
            AnalysisStatus::Pending,
            AnalysisStatus::Processing,
            AnalysisStatus::Completed,
            AnalysisStatus::Failed,
            AnalysisStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<AnalysisStatus>().unwrap(), s);
        }
        assert!("DONE".parse::<AnalysisStatus>().is_err());
    }
}
