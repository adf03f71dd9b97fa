//! Validation run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RunMode, RunStatus, Stage};

/// One tool execution against one stage of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub validation_run_id: i64,
    pub dag_id: Option<String>,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub stage: Stage,
    pub tool: String,
    pub suite: Option<String>,
    pub kind: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub checks_total: i64,
    pub checks_failed: i64,
    pub rows_checked: Option<i64>,
    pub rows_failed: i64,
    pub report_path: Option<String>,
    pub config_hash: Option<String>,
    /// Close message (failure reason, timeout, cancellation)
    pub message: Option<String>,
    pub meta: Option<serde_json::Value>,
}

impl ValidationRun {
    /// Handle for further calls against this run
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            validation_run_id: self.validation_run_id,
            run_id: self.run_id.clone(),
            stage: self.stage,
            tool: self.tool.clone(),
            started_at: self.started_at,
        }
    }
}

/// Parameters for opening a validation run
#[derive(Debug, Clone)]
pub struct OpenRun {
    pub run_id: String,
    pub stage: Stage,
    pub tool: String,
    pub parent_run_id: Option<String>,
    pub dag_id: Option<String>,
    pub suite: Option<String>,
    /// Derived from the run id prefix when not set
    pub kind: Option<RunMode>,
    pub config_hash: Option<String>,
    pub meta: Option<serde_json::Value>,
}

impl OpenRun {
    pub fn new(run_id: impl Into<String>, stage: Stage, tool: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            tool: tool.into(),
            parent_run_id: None,
            dag_id: None,
            suite: None,
            kind: None,
            config_hash: None,
            meta: None,
        }
    }

    pub fn parent(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }

    pub fn dag(mut self, dag_id: impl Into<String>) -> Self {
        self.dag_id = Some(dag_id.into());
        self
    }

    pub fn suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = Some(suite.into());
        self
    }

    pub fn kind(mut self, kind: RunMode) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn config_hash(mut self, config_hash: impl Into<String>) -> Self {
        self.config_hash = Some(config_hash.into());
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn resolved_kind(&self) -> RunMode {
        self.kind.unwrap_or_else(|| RunMode::from_run_id(&self.run_id))
    }
}

/// Handle returned by `open`, threaded through every later call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub validation_run_id: i64,
    pub run_id: String,
    pub stage: Stage,
    pub tool: String,
    pub started_at: DateTime<Utc>,
}

/// Terminal outcome of a validation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    Failed,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Success => RunStatus::Success,
            RunOutcome::Failed => RunStatus::Failed,
        }
    }
}

/// Optional values stamped on a run when it closes
#[derive(Debug, Clone, Default)]
pub struct CloseDetails {
    pub rows_checked: Option<i64>,
    pub report_path: Option<String>,
    pub message: Option<String>,
    /// Merged into the run's existing meta object
    pub meta: Option<serde_json::Value>,
}

impl CloseDetails {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}
