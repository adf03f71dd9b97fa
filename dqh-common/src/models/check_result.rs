//! Check result records produced by tool adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Stage;
use crate::{Error, Result};

/// Outcome of a single rule
///
/// `Error` means the rule itself could not execute (tool crash, missing
/// table). It is distinct from a business-rule `Fail` and is never scored as a
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Error,
    Skip,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Error => "ERROR",
            CheckStatus::Skip => "SKIP",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(CheckStatus::Pass),
            "WARN" => Ok(CheckStatus::Warn),
            "FAIL" => Ok(CheckStatus::Fail),
            "ERROR" => Ok(CheckStatus::Error),
            "SKIP" => Ok(CheckStatus::Skip),
            other => Err(Error::Internal(format!("Unknown check status: {}", other))),
        }
    }
}

/// One rule's outcome, as handed to the validation run tracker
///
/// `rows_failed` carries the row cardinality of set-based checks. `None`
/// marks a single-predicate check that has no cardinality; such a check may
/// FAIL without a row count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub rule_type: Option<String>,
    /// Defaults to the stage of the owning run when not set
    pub etl_stage: Option<Stage>,
    pub status: CheckStatus,
    pub severity: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub rows_failed: Option<i64>,
    pub observed_value: Option<String>,
    pub expected_value: Option<String>,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl CheckResult {
    /// Create a result with the given status, stamped now
    pub fn new(check_name: impl Into<String>, status: CheckStatus) -> Self {
        Self {
            check_name: check_name.into(),
            rule_type: None,
            etl_stage: None,
            status,
            severity: None,
            started_at: crate::time::now(),
            finished_at: None,
            duration_ms: None,
            rows_failed: None,
            observed_value: None,
            expected_value: None,
            message: None,
            details: None,
        }
    }

    /// Set-cardinality check: PASS when no rows violate the rule, FAIL otherwise
    pub fn from_row_count(check_name: impl Into<String>, rows_failed: i64) -> Self {
        let status = if rows_failed == 0 {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        Self::new(check_name, status)
            .with_rows_failed(rows_failed)
            .with_values(rows_failed.to_string(), "0")
    }

    /// Single-predicate check with no row cardinality
    pub fn from_predicate(check_name: impl Into<String>, holds: bool) -> Self {
        let status = if holds { CheckStatus::Pass } else { CheckStatus::Fail };
        Self::new(check_name, status)
    }

    /// The rule could not execute
    pub fn errored(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check_name, CheckStatus::Error).with_message(message)
    }

    pub fn with_rule_type(mut self, rule_type: impl Into<String>) -> Self {
        self.rule_type = Some(rule_type.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.etl_stage = Some(stage);
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    pub fn with_rows_failed(mut self, rows_failed: i64) -> Self {
        self.rows_failed = Some(rows_failed);
        self
    }

    pub fn with_values(mut self, observed: impl Into<String>, expected: impl Into<String>) -> Self {
        self.observed_value = Some(observed.into());
        self.expected_value = Some(expected.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Stamp `finished_at` now and derive `duration_ms` from `started_at`
    pub fn finished(mut self) -> Self {
        let end = crate::time::now();
        self.duration_ms = Some(crate::time::elapsed_ms(&self.started_at, &end));
        self.finished_at = Some(end);
        self
    }

    pub fn is_predicate(&self) -> bool {
        self.rows_failed.is_none()
    }

    /// Validate the ingestion contract
    pub fn validate(&self) -> Result<()> {
        if self.check_name.trim().is_empty() {
            return Err(Error::InvalidInput("check_name must not be empty".to_string()));
        }
        if let Some(rows) = self.rows_failed {
            if rows < 0 {
                return Err(Error::InvalidInput(format!(
                    "check '{}': rows_failed must be >= 0, got {}",
                    self.check_name, rows
                )));
            }
            if self.status == CheckStatus::Fail && rows == 0 {
                return Err(Error::InvalidInput(format!(
                    "check '{}': FAIL with rows_failed = 0 (use a predicate check without row count)",
                    self.check_name
                )));
            }
        }
        if let Some(duration) = self.duration_ms {
            if duration < 0 {
                return Err(Error::InvalidInput(format!(
                    "check '{}': duration_ms must be >= 0",
                    self.check_name
                )));
            }
        }
        if let Some(finished_at) = self.finished_at {
            if finished_at < self.started_at {
                return Err(Error::InvalidInput(format!(
                    "check '{}': finished_at precedes started_at",
                    self.check_name
                )));
            }
        }
        Ok(())
    }
}

/// A check result as read back from the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCheckResult {
    pub validation_check_id: i64,
    pub validation_run_id: i64,
    #[serde(flatten)]
    pub result: CheckResult,
}
