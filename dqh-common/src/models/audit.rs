//! ETL load audit records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Status of one ETL task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    Started,
    Success,
    Failed,
    Ended,
    /// Mutation injected into this entity for an experiment run
    Mutated,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "STARTED",
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Failed => "FAILED",
            AuditStatus::Ended => "ENDED",
            AuditStatus::Mutated => "MUTATED",
        }
    }

    /// Statuses that close a task and get `finished_at` stamped
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuditStatus::Success | AuditStatus::Failed | AuditStatus::Ended
        )
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(AuditStatus::Started),
            "SUCCESS" => Ok(AuditStatus::Success),
            "FAILED" => Ok(AuditStatus::Failed),
            "ENDED" => Ok(AuditStatus::Ended),
            "MUTATED" => Ok(AuditStatus::Mutated),
            other => Err(Error::Internal(format!("Unknown audit status: {}", other))),
        }
    }
}

/// An audit event to append
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub dag_id: String,
    pub run_id: String,
    pub task_id: Option<String>,
    pub layer: String,
    pub entity_name: String,
    pub status: AuditStatus,
    pub rows_processed: Option<i64>,
    pub message: Option<String>,
    /// Defaults to now
    pub started_at: Option<DateTime<Utc>>,
    /// Defaults to now for terminal statuses
    pub finished_at: Option<DateTime<Utc>>,
}

impl AuditEvent {
    pub fn new(
        dag_id: impl Into<String>,
        run_id: impl Into<String>,
        layer: impl Into<String>,
        entity_name: impl Into<String>,
        status: AuditStatus,
    ) -> Self {
        Self {
            dag_id: dag_id.into(),
            run_id: run_id.into(),
            task_id: None,
            layer: layer.into(),
            entity_name: entity_name.into(),
            status,
            rows_processed: None,
            message: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn rows(mut self, rows_processed: i64) -> Self {
        self.rows_processed = Some(rows_processed);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn finished_at(mut self, finished_at: DateTime<Utc>) -> Self {
        self.finished_at = Some(finished_at);
        self
    }
}

/// A persisted audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: i64,
    pub dag_id: String,
    pub run_id: String,
    pub task_id: Option<String>,
    pub layer: String,
    pub entity_name: String,
    pub status: AuditStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_processed: Option<i64>,
    pub message: Option<String>,
}

/// Wall time spent on one entity within a run/layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTiming {
    pub run_id: String,
    pub layer: String,
    pub entity_name: String,
    pub tasks: i64,
    pub seconds_sum: f64,
}
