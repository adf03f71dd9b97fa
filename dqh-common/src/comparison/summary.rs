//! Flat summary export
//!
//! One row per (run pair, stage, tool, run mode, check). Column order and
//! names are stable; downstream notebooks select by name.

use serde::{Deserialize, Serialize};
use std::io::Write;

use super::Verdict;
use crate::models::{CheckStatus, RunMode, Stage};
use crate::{Error, Result};

pub const SUMMARY_COLUMNS: [&str; 14] = [
    "baseline_run_id",
    "experiment_run_id",
    "stage",
    "tool",
    "run_mode",
    "run_id",
    "check_name",
    "rule_type",
    "check_status",
    "checks_total",
    "checks_failed",
    "rows_checked",
    "rows_failed",
    "detection_verdict",
];

/// Field order matches `SUMMARY_COLUMNS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub baseline_run_id: String,
    pub experiment_run_id: String,
    pub stage: Stage,
    pub tool: String,
    pub run_mode: RunMode,
    pub run_id: String,
    /// `None` on the placeholder row of a side with no validation run
    pub check_name: Option<String>,
    pub rule_type: Option<String>,
    /// Status of the last recorded attempt
    pub check_status: Option<CheckStatus>,
    /// Attempts recorded under this check name
    pub checks_total: i64,
    pub checks_failed: i64,
    /// Run-level value reported by the tool
    pub rows_checked: Option<i64>,
    /// Sum over FAIL attempts
    pub rows_failed: i64,
    pub detection_verdict: Verdict,
}

impl SummaryRow {
    pub fn cells(&self) -> [String; 14] {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(ToString::to_string).unwrap_or_default()
        }

        [
            self.baseline_run_id.clone(),
            self.experiment_run_id.clone(),
            self.stage.code().to_string(),
            self.tool.clone(),
            self.run_mode.as_str().to_string(),
            self.run_id.clone(),
            opt(&self.check_name),
            opt(&self.rule_type),
            opt(&self.check_status),
            self.checks_total.to_string(),
            self.checks_failed.to_string(),
            opt(&self.rows_checked),
            self.rows_failed.to_string(),
            self.detection_verdict.to_string(),
        ]
    }
}

fn tsv_escape(cell: &str) -> String {
    cell.replace(['\t', '\n', '\r'], " ")
}

/// Tab-separated, header first
pub fn write_tsv<W: Write>(rows: &[SummaryRow], mut out: W) -> Result<()> {
    writeln!(out, "{}", SUMMARY_COLUMNS.join("\t"))?;
    for row in rows {
        let cells: Vec<String> = row.cells().iter().map(|c| tsv_escape(c)).collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    out.flush()?;
    Ok(())
}

/// JSON array of objects keyed by column name
pub fn to_json(rows: &[SummaryRow]) -> Result<String> {
    serde_json::to_string_pretty(rows)
        .map_err(|e| Error::Internal(format!("Failed to serialize summary: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> SummaryRow {
        SummaryRow {
            baseline_run_id: "b1".to_string(),
            experiment_run_id: "exp_e1".to_string(),
            stage: Stage::Load,
            tool: "sql".to_string(),
            run_mode: RunMode::Experiment,
            run_id: "exp_e1".to_string(),
            check_name: Some("fk_home_team".to_string()),
            rule_type: Some("foreign_key".to_string()),
            check_status: Some(CheckStatus::Fail),
            checks_total: 1,
            checks_failed: 1,
            rows_checked: None,
            rows_failed: 3,
            detection_verdict: Verdict::Detected,
        }
    }

    #[test]
    fn test_json_keys_follow_column_order() {
        let value = serde_json::to_value(row()).unwrap();
        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        let mut expected = SUMMARY_COLUMNS.to_vec();
        // serde_json's default map is sorted
        expected.sort_unstable();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_tsv_output() {
        let mut buf = Vec::new();
        write_tsv(&[row()], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], SUMMARY_COLUMNS.join("\t"));
        assert_eq!(
            lines[1],
            "b1\texp_e1\tL\tsql\texperiment\texp_e1\tfk_home_team\tforeign_key\tFAIL\t1\t1\t\t3\tdetected"
        );
    }

    #[test]
    fn test_tsv_escapes_separators() {
        let mut r = row();
        r.check_name = Some("bad\tname\nhere".to_string());
        let mut buf = Vec::new();
        write_tsv(&[r], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.lines().nth(1).unwrap().contains("bad name here"));
    }
}
