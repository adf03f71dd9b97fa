//! Tool adapters
//!
//! A tool adapter wraps one validation-rule engine. It receives the stage
//! target, streams `CheckResult`s into a `CheckSink` as checks finish and
//! returns an `AdapterReport`; the runner owns the run lifecycle around it and
//! never branches on which tool it is driving.

pub mod resources;
pub mod runner;
pub mod sql_count;

pub use resources::ResourceMeter;
pub use runner::{layer_name, StageRunner, ToolOutcome, ToolRunSummary};
pub use sql_count::{SqlCheckSpec, SqlCountAdapter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{CheckResult, CheckStatus, RunHandle, RunMode, Stage};
use crate::tracking::ValidationRunTracker;

/// What one stage validation runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTarget {
    pub stage: Stage,
    pub run_id: String,
    /// Baseline run id for experiments; the run itself for baselines
    pub parent_run_id: String,
    pub dag_id: Option<String>,
}

impl StageTarget {
    pub fn baseline(stage: Stage, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            stage,
            parent_run_id: run_id.clone(),
            run_id,
            dag_id: None,
        }
    }

    pub fn experiment(
        stage: Stage,
        run_id: impl Into<String>,
        baseline_run_id: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            run_id: run_id.into(),
            parent_run_id: baseline_run_id.into(),
            dag_id: None,
        }
    }

    pub fn with_dag(mut self, dag_id: impl Into<String>) -> Self {
        self.dag_id = Some(dag_id.into());
        self
    }

    pub fn kind(&self) -> RunMode {
        if self.run_id != self.parent_run_id {
            RunMode::Experiment
        } else {
            RunMode::from_run_id(&self.run_id)
        }
    }
}

/// Run-level values an adapter reports when it completes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterReport {
    pub rows_checked: Option<i64>,
    pub report_path: Option<String>,
    pub meta: Option<serde_json::Value>,
}

/// Receives check results while a tool executes
#[async_trait]
pub trait CheckSink: Send {
    async fn record(&mut self, check: CheckResult) -> crate::Result<()>;
}

/// Validation tool capability
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tool identifier stored on the validation run (e.g. "sql", "soda")
    fn tool(&self) -> &str;

    fn suite(&self) -> Option<String> {
        None
    }

    /// Fingerprint of the rule configuration, see `config_fingerprint`
    fn config_hash(&self) -> Option<String> {
        None
    }

    /// Execute every check for `target`, feeding results to `sink`
    ///
    /// An `Err` means the tool itself broke; checks already recorded are kept
    /// and the run closes FAILED.
    async fn execute(
        &self,
        target: &StageTarget,
        sink: &mut dyn CheckSink,
    ) -> anyhow::Result<AdapterReport>;
}

/// Sink writing straight through to the validation run tracker
pub struct TrackerSink {
    tracker: ValidationRunTracker,
    handle: RunHandle,
    recorded: u32,
    failing: u32,
}

impl TrackerSink {
    pub fn new(tracker: ValidationRunTracker, handle: RunHandle) -> Self {
        Self {
            tracker,
            handle,
            recorded: 0,
            failing: 0,
        }
    }

    pub fn recorded(&self) -> u32 {
        self.recorded
    }

    /// Checks that ended FAIL or ERROR
    pub fn failing(&self) -> u32 {
        self.failing
    }
}

#[async_trait]
impl CheckSink for TrackerSink {
    async fn record(&mut self, check: CheckResult) -> crate::Result<()> {
        self.tracker.record_check(&self.handle, &check).await?;
        self.recorded += 1;
        if matches!(check.status, CheckStatus::Fail | CheckStatus::Error) {
            self.failing += 1;
        }
        Ok(())
    }
}

/// Collects results in memory
#[derive(Debug, Default)]
pub struct VecSink {
    pub checks: Vec<CheckResult>,
}

#[async_trait]
impl CheckSink for VecSink {
    async fn record(&mut self, check: CheckResult) -> crate::Result<()> {
        check.validate()?;
        self.checks.push(check);
        Ok(())
    }
}
