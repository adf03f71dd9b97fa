//! Raw SQL constraint adapter
//!
//! Each check is a `SELECT COUNT(*)` of violating rows: 0 passes, anything
//! else fails with that many `rows_failed`. A query that cannot run is an
//! ERROR result, not an adapter failure.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::debug;

use super::{AdapterReport, CheckSink, StageTarget, ToolAdapter};
use crate::fingerprint::config_fingerprint;
use crate::models::{CheckResult, Stage};

/// One SQL constraint
///
/// `count_sql` may contain `{run_id}` and `{parent_run_id}` placeholders; they
/// are substituted as quoted SQL string literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCheckSpec {
    pub name: String,
    pub rule_type: Option<String>,
    pub severity: Option<String>,
    /// Only run for this stage; `None` runs for every stage
    pub stage: Option<Stage>,
    pub count_sql: String,
    /// Query listing the violating rows, kept in the check details
    pub fail_sql: Option<String>,
}

impl SqlCheckSpec {
    pub fn new(name: impl Into<String>, count_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rule_type: None,
            severity: None,
            stage: None,
            count_sql: count_sql.into(),
            fail_sql: None,
        }
    }

    pub fn rule_type(mut self, rule_type: impl Into<String>) -> Self {
        self.rule_type = Some(rule_type.into());
        self
    }

    pub fn severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn fail_sql(mut self, fail_sql: impl Into<String>) -> Self {
        self.fail_sql = Some(fail_sql.into());
        self
    }

    fn render(&self, target: &StageTarget) -> String {
        self.count_sql
            .replace("{run_id}", &sql_literal(&target.run_id))
            .replace("{parent_run_id}", &sql_literal(&target.parent_run_id))
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sanitize(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "id".to_string()
    } else {
        cleaned
    }
}

pub struct SqlCountAdapter {
    pool: SqlitePool,
    checks: Vec<SqlCheckSpec>,
    report_dir: Option<PathBuf>,
}

impl SqlCountAdapter {
    pub fn new(pool: SqlitePool, checks: Vec<SqlCheckSpec>) -> Self {
        Self {
            pool,
            checks,
            report_dir: None,
        }
    }

    /// Write a JSON report of every check into `dir`
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    async fn write_report(
        &self,
        dir: &Path,
        target: &StageTarget,
        checks: &[serde_json::Value],
    ) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating report dir {}", dir.display()))?;

        let file = dir.join(format!(
            "sql_constraints_{}_{}_{}.json",
            target.stage.code().to_lowercase(),
            target.kind(),
            sanitize(&target.run_id)
        ));
        let body = serde_json::to_string_pretty(&json!({ "checks": checks }))?;
        tokio::fs::write(&file, body)
            .await
            .with_context(|| format!("writing report {}", file.display()))?;

        Ok(file.display().to_string())
    }
}

#[async_trait]
impl ToolAdapter for SqlCountAdapter {
    fn tool(&self) -> &str {
        "sql"
    }

    fn suite(&self) -> Option<String> {
        Some("constraints".to_string())
    }

    fn config_hash(&self) -> Option<String> {
        serde_json::to_vec(&self.checks)
            .ok()
            .map(config_fingerprint)
    }

    async fn execute(
        &self,
        target: &StageTarget,
        sink: &mut dyn CheckSink,
    ) -> anyhow::Result<AdapterReport> {
        let mut report_checks = Vec::new();

        for spec in &self.checks {
            if spec.stage.is_some_and(|s| s != target.stage) {
                continue;
            }

            let sql = spec.render(target);
            let started = crate::time::now();
            let counted: Result<i64, sqlx::Error> =
                sqlx::query_scalar(&sql).fetch_one(&self.pool).await;

            let mut check = match counted {
                Ok(count) => {
                    let check = CheckResult::from_row_count(&spec.name, count);
                    if count > 0 {
                        check.with_message("Constraint violation")
                    } else {
                        check
                    }
                }
                Err(e) => CheckResult::errored(&spec.name, e.to_string()),
            };
            check.started_at = started;
            check = check
                .with_stage(target.stage)
                .with_details(json!({ "count_sql": sql, "fail_sql": spec.fail_sql }))
                .finished();
            if let Some(rule_type) = &spec.rule_type {
                check = check.with_rule_type(rule_type);
            }
            if let Some(severity) = &spec.severity {
                check = check.with_severity(severity);
            }

            debug!(check = %spec.name, status = %check.status, rows_failed = ?check.rows_failed, "SQL check evaluated");

            report_checks.push(json!({
                "name": spec.name,
                "rule_group": spec.rule_type,
                "severity": spec.severity,
                "status": check.status,
                "rows_failed": check.rows_failed,
                "count_sql": sql,
                "fail_sql": spec.fail_sql,
            }));
            sink.record(check).await?;
        }

        let report_path = match &self.report_dir {
            Some(dir) => Some(self.write_report(dir, target, &report_checks).await?),
            None => None,
        };

        Ok(AdapterReport {
            rows_checked: None,
            report_path,
            meta: Some(json!({ "checks_configured": self.checks.len() })),
        })
    }
}
