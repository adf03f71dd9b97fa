//! Harness data model
//!
//! Status enums are persisted as their upper-case text form (`NEW`, `PASS`, ...)
//! and parsed back with `FromStr`; an unknown persisted value is an
//! `Error::Internal`, never silently defaulted.

mod audit;
mod batch;
mod check_result;
mod validation_run;

pub use audit::{AuditEntry, AuditEvent, AuditStatus, EntityTiming};
pub use batch::BatchStatus;
pub use check_result::{CheckResult, CheckStatus, StoredCheckResult};
pub use validation_run::{CloseDetails, OpenRun, RunHandle, RunOutcome, ValidationRun};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// One ETL stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "E")]
    Extract,
    #[serde(rename = "T")]
    Transform,
    #[serde(rename = "L")]
    Load,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Transform, Stage::Load];

    /// Single-letter code stored in the `layer`/`etl_stage` columns
    pub fn code(&self) -> &'static str {
        match self {
            Stage::Extract => "E",
            Stage::Transform => "T",
            Stage::Load => "L",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "E" | "EXTRACT" => Ok(Stage::Extract),
            "T" | "TRANSFORM" => Ok(Stage::Transform),
            "L" | "LOAD" => Ok(Stage::Load),
            other => Err(Error::InvalidInput(format!("Unsupported stage: {}", other))),
        }
    }
}

/// Lifecycle status shared by batch status rows and validation runs
///
/// `NEW -> PROCESSING -> {SUCCESS, FAILED}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    New,
    Processing,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::New => "NEW",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            RunStatus::New => 0,
            RunStatus::Processing => 1,
            RunStatus::Success | RunStatus::Failed => 2,
        }
    }

    /// Batch status lifecycle: forward only, plus `FAILED -> PROCESSING` on retry.
    ///
    /// Re-asserting the current status is allowed (refreshes timestamps and the
    /// error message). `SUCCESS` is final for a given run/layer pair.
    pub fn batch_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
        if from == to {
            return true;
        }
        match (from, to) {
            (RunStatus::Failed, RunStatus::Processing) => true,
            (from, to) => !from.is_terminal() && to.rank() > from.rank(),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(RunStatus::New),
            "PROCESSING" => Ok(RunStatus::Processing),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(Error::Internal(format!("Unknown run status: {}", other))),
        }
    }
}

/// Whether a run executed against unmodified or mutated data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Baseline,
    Experiment,
}

impl RunMode {
    /// Prefix the driver gives to mutated runs
    pub const EXPERIMENT_PREFIX: &'static str = "exp_";

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Baseline => "baseline",
            RunMode::Experiment => "experiment",
        }
    }

    /// Classify a run id by naming convention
    pub fn from_run_id(run_id: &str) -> Self {
        if run_id.starts_with(Self::EXPERIMENT_PREFIX) {
            RunMode::Experiment
        } else {
            RunMode::Baseline
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(RunMode::Baseline),
            "experiment" => Ok(RunMode::Experiment),
            other => Err(Error::Internal(format!("Unknown run mode: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_accepts_codes_and_names() {
        assert_eq!("e".parse::<Stage>().unwrap(), Stage::Extract);
        assert_eq!("Transform".parse::<Stage>().unwrap(), Stage::Transform);
        assert_eq!(" L ".parse::<Stage>().unwrap(), Stage::Load);
        assert!("STG".parse::<Stage>().is_err());
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [RunStatus::New, RunStatus::Processing, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(matches!("DONE".parse::<RunStatus>(), Err(Error::Internal(_))));
    }

    #[test]
    fn test_batch_transitions_forward_only() {
        use RunStatus::*;
        assert!(RunStatus::batch_transition_allowed(New, Processing));
        assert!(RunStatus::batch_transition_allowed(New, Failed));
        assert!(RunStatus::batch_transition_allowed(Processing, Success));
        assert!(RunStatus::batch_transition_allowed(Processing, Failed));
        assert!(RunStatus::batch_transition_allowed(Failed, Processing));
        assert!(RunStatus::batch_transition_allowed(Success, Success));

        assert!(!RunStatus::batch_transition_allowed(Processing, New));
        assert!(!RunStatus::batch_transition_allowed(Success, Processing));
        assert!(!RunStatus::batch_transition_allowed(Success, Failed));
        assert!(!RunStatus::batch_transition_allowed(Failed, Success));
        assert!(!RunStatus::batch_transition_allowed(Failed, New));
    }

    #[test]
    fn test_run_mode_from_run_id() {
        assert_eq!(RunMode::from_run_id("exp_001_stg"), RunMode::Experiment);
        assert_eq!(RunMode::from_run_id("manual__2024-01-01"), RunMode::Baseline);
    }
}
