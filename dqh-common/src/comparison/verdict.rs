//! Detection verdicts and per-tool detection metrics

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::models::{CheckStatus, Stage};

/// How one check behaved across a baseline/experiment pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "detected")]
    Detected,
    #[serde(rename = "missed")]
    Missed,
    #[serde(rename = "false_positive")]
    FalsePositive,
    #[serde(rename = "unaffected")]
    Unaffected,
    /// One side has no closed validation run for the stage/tool
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Detected => "detected",
            Verdict::Missed => "missed",
            Verdict::FalsePositive => "false_positive",
            Verdict::Unaffected => "unaffected",
            Verdict::Skipped => "SKIPPED",
        }
    }

    /// Verdict for a check whose runs exist on both sides
    ///
    /// `None` means the run did not report the check. A baseline FAIL always
    /// wins: the rule fires on clean data, so an experiment FAIL proves nothing.
    /// `Error` never counts as a detection.
    pub fn classify(
        baseline: Option<CheckStatus>,
        experiment: Option<CheckStatus>,
        in_scope: bool,
    ) -> Verdict {
        if baseline == Some(CheckStatus::Fail) {
            return Verdict::FalsePositive;
        }
        match (experiment, in_scope) {
            (Some(CheckStatus::Fail), true) => Verdict::Detected,
            (Some(CheckStatus::Fail), false) => Verdict::FalsePositive,
            (_, true) => Verdict::Missed,
            (_, false) => Verdict::Unaffected,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks that cover the mutated area
///
/// An empty scope covers every check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationScope {
    pub rule_types: BTreeSet<String>,
    pub check_names: BTreeSet<String>,
}

impl MutationScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_rule_type(mut self, rule_type: impl Into<String>) -> Self {
        self.rule_types.insert(rule_type.into());
        self
    }

    pub fn with_check(mut self, check_name: impl Into<String>) -> Self {
        self.check_names.insert(check_name.into());
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.rule_types.is_empty() && self.check_names.is_empty()
    }

    pub fn covers(&self, check_name: &str, rule_type: Option<&str>) -> bool {
        self.is_unrestricted()
            || self.check_names.contains(check_name)
            || rule_type.is_some_and(|r| self.rule_types.contains(r))
    }
}

/// Verdict counts for one (stage, tool)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetrics {
    pub stage: Stage,
    pub tool: String,
    pub detected: u32,
    pub missed: u32,
    pub false_positive: u32,
    pub unaffected: u32,
    pub skipped: u32,
    /// detected / (detected + missed); `None` when nothing was in scope
    pub detection_rate: Option<f64>,
}

impl DetectionMetrics {
    pub fn new(stage: Stage, tool: impl Into<String>) -> Self {
        Self {
            stage,
            tool: tool.into(),
            detected: 0,
            missed: 0,
            false_positive: 0,
            unaffected: 0,
            skipped: 0,
            detection_rate: None,
        }
    }

    pub fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Detected => self.detected += 1,
            Verdict::Missed => self.missed += 1,
            Verdict::FalsePositive => self.false_positive += 1,
            Verdict::Unaffected => self.unaffected += 1,
            Verdict::Skipped => self.skipped += 1,
        }
        let denominator = self.detected + self.missed;
        self.detection_rate = if denominator == 0 {
            None
        } else {
            Some(self.detected as f64 / denominator as f64)
        };
    }
}
