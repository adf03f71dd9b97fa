//! Validation run tracker
//!
//! Owns the `NEW -> PROCESSING -> {SUCCESS, FAILED}` lifecycle of one tool
//! execution and the check results recorded under it.
//!
//! - `open` is compare-and-insert: the guarded INSERT and the partial unique
//!   index on (run_id, layer, tool) for non-terminal rows make two concurrent
//!   opens of the same key impossible.
//! - `record_check` bumps the parent's counters and inserts the check result in
//!   one transaction, so `checks_failed` always equals the number of FAIL
//!   children.
//! - `close` is a conditional UPDATE; re-closing with the same outcome is a
//!   no-op, with a different outcome a `Conflict`.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::{DuplicateCheckPolicy, ReopenPolicy, TrackerPolicy};
use crate::db::retry_on_lock;
use crate::models::{
    CheckResult, CheckStatus, CloseDetails, OpenRun, RunHandle, RunOutcome, RunStatus, Stage,
    StoredCheckResult, ValidationRun,
};
use crate::time;
use crate::{Error, Result};

const RUN_COLUMNS: &str = r#"
    validation_run_id, dag_id, run_id, parent_run_id, layer, tool, suite, kind,
    status, started_at, finished_at, duration_ms, checks_total, checks_failed,
    rows_checked, rows_failed, report_path, config_hash, message, meta
"#;

const CHECK_COLUMNS: &str = r#"
    validation_check_id, validation_run_id, check_name, rule_type, etl_stage,
    status, severity, started_at, finished_at, duration_ms, rows_failed,
    observed_value, expected_value, message, details
"#;

/// A run whose stored FAIL counter disagrees with its check results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDrift {
    pub validation_run_id: i64,
    pub checks_failed: i64,
    pub failed_children: i64,
}

#[derive(Clone)]
pub struct ValidationRunTracker {
    pool: SqlitePool,
    policy: TrackerPolicy,
    max_lock_wait_ms: u64,
}

impl ValidationRunTracker {
    pub fn new(pool: SqlitePool, policy: TrackerPolicy) -> Self {
        Self {
            pool,
            policy,
            max_lock_wait_ms: 5000,
        }
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn policy(&self) -> TrackerPolicy {
        self.policy
    }

    /// Open a validation run and move it to PROCESSING
    ///
    /// Fails with `DuplicateRun` while another non-terminal run exists for the
    /// same (run_id, layer, tool); with `ReopenPolicy::Reject` also when a
    /// closed one exists.
    pub async fn open(&self, request: &OpenRun) -> Result<RunHandle> {
        if request.run_id.trim().is_empty() || request.tool.trim().is_empty() {
            return Err(Error::InvalidInput(
                "run_id and tool must not be empty".to_string(),
            ));
        }
        retry_on_lock("open validation run", self.max_lock_wait_ms, || {
            self.try_open(request)
        })
        .await
    }

    async fn try_open(&self, request: &OpenRun) -> Result<RunHandle> {
        let started_at = time::now();
        let meta = request
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Internal(format!("Failed to serialize meta: {}", e)))?;

        let guard = match self.policy.reopen_policy {
            ReopenPolicy::NewRun => "AND status IN ('NEW', 'PROCESSING')",
            ReopenPolicy::Reject => "",
        };
        let sql = format!(
            r#"
            INSERT INTO validation_run (
                dag_id, run_id, parent_run_id, layer, tool, suite, kind,
                status, started_at, config_hash, meta
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, 'NEW', ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM validation_run
                WHERE run_id = ? AND layer = ? AND tool = ? {}
            )
            RETURNING validation_run_id
            "#,
            guard
        );

        let mut tx = self.pool.begin().await?;

        let inserted: std::result::Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(&sql)
            .bind(&request.dag_id)
            .bind(&request.run_id)
            .bind(&request.parent_run_id)
            .bind(request.stage.code())
            .bind(&request.tool)
            .bind(&request.suite)
            .bind(request.resolved_kind().as_str())
            .bind(time::to_db(&started_at))
            .bind(&request.config_hash)
            .bind(&meta)
            .bind(&request.run_id)
            .bind(request.stage.code())
            .bind(&request.tool)
            .fetch_optional(&mut *tx)
            .await;

        let validation_run_id = match inserted {
            Ok(Some(id)) => id,
            Ok(None) => {
                drop(tx);
                return Err(self.duplicate_error(request).await?);
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                drop(tx);
                return Err(self.duplicate_error(request).await?);
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query(
            "UPDATE validation_run SET status = 'PROCESSING' WHERE validation_run_id = ? AND status = 'NEW'",
        )
        .bind(validation_run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            validation_run_id,
            run_id = %request.run_id,
            layer = %request.stage,
            tool = %request.tool,
            "Validation run opened (NEW -> PROCESSING)"
        );

        Ok(RunHandle {
            validation_run_id,
            run_id: request.run_id.clone(),
            stage: request.stage,
            tool: request.tool.clone(),
            started_at,
        })
    }

    async fn duplicate_error(&self, request: &OpenRun) -> Result<Error> {
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT validation_run_id FROM validation_run
            WHERE run_id = ? AND layer = ? AND tool = ?
            ORDER BY CASE WHEN status IN ('NEW', 'PROCESSING') THEN 0 ELSE 1 END,
                     validation_run_id DESC
            LIMIT 1
            "#,
        )
        .bind(&request.run_id)
        .bind(request.stage.code())
        .bind(&request.tool)
        .fetch_optional(&self.pool)
        .await?;

        warn!(
            run_id = %request.run_id,
            layer = %request.stage,
            tool = %request.tool,
            existing = ?existing,
            "Rejected duplicate validation run open"
        );

        Ok(Error::DuplicateRun {
            run_id: request.run_id.clone(),
            layer: request.stage.code().to_string(),
            tool: request.tool.clone(),
            existing: existing.unwrap_or_default(),
        })
    }

    /// Append a check result to a PROCESSING run
    ///
    /// Returns the new `validation_check_id`.
    pub async fn record_check(&self, handle: &RunHandle, check: &CheckResult) -> Result<i64> {
        check.validate()?;
        retry_on_lock("record validation check", self.max_lock_wait_ms, || {
            self.try_record_check(handle, check)
        })
        .await
    }

    async fn try_record_check(&self, handle: &RunHandle, check: &CheckResult) -> Result<i64> {
        let failed = check.status == CheckStatus::Fail;
        let details = check
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Internal(format!("Failed to serialize details: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        // Counter bump first: it takes the write lock and doubles as the state check
        let updated = sqlx::query(
            r#"
            UPDATE validation_run
            SET checks_total = checks_total + 1,
                checks_failed = checks_failed + ?,
                rows_failed = rows_failed + ?
            WHERE validation_run_id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(failed as i64)
        .bind(if failed { check.rows_failed.unwrap_or(0) } else { 0 })
        .bind(handle.validation_run_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            drop(tx);
            return Err(self.not_accepting(handle.validation_run_id, RunStatus::Processing).await);
        }

        if self.policy.duplicate_checks == DuplicateCheckPolicy::Reject {
            let seen: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM validation_check_result WHERE validation_run_id = ? AND check_name = ?",
            )
            .bind(handle.validation_run_id)
            .bind(&check.check_name)
            .fetch_one(&mut *tx)
            .await?;

            if seen > 0 {
                return Err(Error::Conflict(format!(
                    "check '{}' already recorded for validation run {}",
                    check.check_name, handle.validation_run_id
                )));
            }
        }

        let validation_check_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO validation_check_result (
                validation_run_id, check_name, rule_type, etl_stage, status, severity,
                started_at, finished_at, duration_ms, rows_failed,
                observed_value, expected_value, message, details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING validation_check_id
            "#,
        )
        .bind(handle.validation_run_id)
        .bind(&check.check_name)
        .bind(&check.rule_type)
        .bind(check.etl_stage.unwrap_or(handle.stage).code())
        .bind(check.status.as_str())
        .bind(&check.severity)
        .bind(time::to_db(&check.started_at))
        .bind(check.finished_at.as_ref().map(time::to_db))
        .bind(check.duration_ms)
        .bind(check.rows_failed)
        .bind(&check.observed_value)
        .bind(&check.expected_value)
        .bind(&check.message)
        .bind(&details)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            validation_run_id = handle.validation_run_id,
            check = %check.check_name,
            status = %check.status,
            rows_failed = ?check.rows_failed,
            "Recorded check result"
        );

        Ok(validation_check_id)
    }

    /// Move a run to its terminal status
    pub async fn close(
        &self,
        handle: &RunHandle,
        outcome: RunOutcome,
        details: CloseDetails,
    ) -> Result<ValidationRun> {
        retry_on_lock("close validation run", self.max_lock_wait_ms, || {
            self.try_close(handle, outcome, &details)
        })
        .await
    }

    async fn try_close(
        &self,
        handle: &RunHandle,
        outcome: RunOutcome,
        details: &CloseDetails,
    ) -> Result<ValidationRun> {
        let finished_at = time::now();
        let duration_ms = time::elapsed_ms(&handle.started_at, &finished_at);
        let target = outcome.status();
        let meta = details
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Internal(format!("Failed to serialize meta: {}", e)))?;

        let updated = sqlx::query(
            r#"
            UPDATE validation_run
            SET status = ?,
                finished_at = ?,
                duration_ms = ?,
                rows_checked = COALESCE(?, rows_checked),
                report_path = COALESCE(?, report_path),
                message = COALESCE(?, message),
                meta = CASE WHEN ? IS NULL THEN meta
                            ELSE json_patch(COALESCE(meta, '{}'), ?) END
            WHERE validation_run_id = ? AND status IN ('NEW', 'PROCESSING')
            "#,
        )
        .bind(target.as_str())
        .bind(time::to_db(&finished_at))
        .bind(duration_ms)
        .bind(details.rows_checked)
        .bind(&details.report_path)
        .bind(&details.message)
        .bind(&meta)
        .bind(&meta)
        .bind(handle.validation_run_id)
        .execute(&self.pool)
        .await?;

        let run = self
            .find_by_id(handle.validation_run_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("validation run {}", handle.validation_run_id))
            })?;

        if updated.rows_affected() == 1 {
            info!(
                validation_run_id = run.validation_run_id,
                run_id = %run.run_id,
                layer = %run.stage,
                tool = %run.tool,
                status = %run.status,
                checks_total = run.checks_total,
                checks_failed = run.checks_failed,
                duration_ms,
                "Validation run closed"
            );
            return Ok(run);
        }

        if run.status == target {
            debug!(
                validation_run_id = run.validation_run_id,
                status = %run.status,
                "Validation run already closed with the same outcome"
            );
            Ok(run)
        } else {
            warn!(
                validation_run_id = run.validation_run_id,
                current = %run.status,
                requested = %target,
                "Rejected re-close with a different outcome"
            );
            Err(Error::Conflict(format!(
                "validation run {} is already {}, cannot close as {}",
                run.validation_run_id, run.status, target
            )))
        }
    }

    async fn not_accepting(&self, validation_run_id: i64, expected: RunStatus) -> Error {
        match self.find_by_id(validation_run_id).await {
            Ok(Some(run)) => Error::InvalidState {
                validation_run_id,
                status: run.status.to_string(),
                expected: expected.to_string(),
            },
            Ok(None) => Error::NotFound(format!("validation run {}", validation_run_id)),
            Err(e) => e,
        }
    }

    /// Most recent run for (run_id, layer, tool)
    pub async fn get(&self, run_id: &str, stage: Stage, tool: &str) -> Result<ValidationRun> {
        let sql = format!(
            "SELECT {} FROM validation_run WHERE run_id = ? AND layer = ? AND tool = ? \
             ORDER BY validation_run_id DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(stage.code())
            .bind(tool)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => run_from_row(&row),
            None => Err(Error::NotFound(format!(
                "validation run {}/{}/{}",
                run_id, stage, tool
            ))),
        }
    }

    pub async fn find_by_id(&self, validation_run_id: i64) -> Result<Option<ValidationRun>> {
        let sql = format!(
            "SELECT {} FROM validation_run WHERE validation_run_id = ?",
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(validation_run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    /// Handle of the non-terminal run for a key, if any
    ///
    /// Used by an external watchdog to close a stuck run as FAILED.
    pub async fn find_active(
        &self,
        run_id: &str,
        stage: Stage,
        tool: &str,
    ) -> Result<Option<RunHandle>> {
        let sql = format!(
            "SELECT {} FROM validation_run WHERE run_id = ? AND layer = ? AND tool = ? \
             AND status IN ('NEW', 'PROCESSING')",
            RUN_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(stage.code())
            .bind(tool)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(run_from_row).transpose()?.map(|r| r.handle()))
    }

    /// All runs of one run id, oldest first
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<ValidationRun>> {
        let sql = format!(
            "SELECT {} FROM validation_run WHERE run_id = ? ORDER BY validation_run_id",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(run_id).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Check results of one run in recording order
    pub async fn check_results(&self, validation_run_id: i64) -> Result<Vec<StoredCheckResult>> {
        let sql = format!(
            "SELECT {} FROM validation_check_result WHERE validation_run_id = ? \
             ORDER BY validation_check_id",
            CHECK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(validation_run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(check_from_row).collect()
    }

    /// Delete one run; its check results cascade
    pub async fn delete(&self, validation_run_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM validation_run WHERE validation_run_id = ?")
            .bind(validation_run_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("validation run {}", validation_run_id)));
        }
        info!(validation_run_id, "Deleted validation run");
        Ok(())
    }

    /// Remove earlier runs of a layer/tool before an experiment is repeated
    ///
    /// `run_ids = None` clears every run of the layer/tool (for `dag_id` when given).
    pub async fn delete_for_layer(
        &self,
        dag_id: Option<&str>,
        stage: Stage,
        tool: &str,
        run_ids: Option<&[String]>,
    ) -> Result<u64> {
        let mut sql = String::from("DELETE FROM validation_run WHERE layer = ? AND tool = ?");
        if dag_id.is_some() {
            sql.push_str(" AND dag_id = ?");
        }
        if let Some(ids) = run_ids {
            if ids.is_empty() {
                return Ok(0);
            }
            sql.push_str(&format!(" AND run_id IN ({})", vec!["?"; ids.len()].join(", ")));
        }

        let mut query = sqlx::query(&sql).bind(stage.code()).bind(tool);
        if let Some(dag_id) = dag_id {
            query = query.bind(dag_id);
        }
        for id in run_ids.unwrap_or_default() {
            query = query.bind(id);
        }

        let deleted = query.execute(&self.pool).await?.rows_affected();
        info!(layer = %stage, tool, deleted, "Deleted validation runs for repeat");
        Ok(deleted)
    }

    /// Runs whose `checks_failed` disagrees with their FAIL children
    pub async fn counter_drift(&self) -> Result<Vec<CounterDrift>> {
        let rows = sqlx::query(
            r#"
            SELECT r.validation_run_id, r.checks_failed,
                   (SELECT COUNT(*) FROM validation_check_result c
                    WHERE c.validation_run_id = r.validation_run_id AND c.status = 'FAIL') AS failed_children
            FROM validation_run r
            WHERE r.checks_failed <> (SELECT COUNT(*) FROM validation_check_result c
                                      WHERE c.validation_run_id = r.validation_run_id AND c.status = 'FAIL')
            ORDER BY r.validation_run_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CounterDrift {
                validation_run_id: row.get("validation_run_id"),
                checks_failed: row.get("checks_failed"),
                failed_children: row.get("failed_children"),
            })
            .collect())
    }
}

fn parse_json(value: Option<String>, column: &str) -> Result<Option<serde_json::Value>> {
    value
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", column, e)))
}

fn run_from_row(row: &SqliteRow) -> Result<ValidationRun> {
    let layer: String = row.try_get("layer")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;

    Ok(ValidationRun {
        validation_run_id: row.try_get("validation_run_id")?,
        dag_id: row.try_get("dag_id")?,
        run_id: row.try_get("run_id")?,
        parent_run_id: row.try_get("parent_run_id")?,
        stage: layer
            .parse()
            .map_err(|_| Error::Internal(format!("Unknown stage in validation_run: {}", layer)))?,
        tool: row.try_get("tool")?,
        suite: row.try_get("suite")?,
        kind: kind.parse()?,
        status: status.parse()?,
        started_at: time::from_db(&started_at)?,
        finished_at: time::from_db_opt(row.try_get("finished_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
        checks_total: row.try_get("checks_total")?,
        checks_failed: row.try_get("checks_failed")?,
        rows_checked: row.try_get("rows_checked")?,
        rows_failed: row.try_get("rows_failed")?,
        report_path: row.try_get("report_path")?,
        config_hash: row.try_get("config_hash")?,
        message: row.try_get("message")?,
        meta: parse_json(row.try_get("meta")?, "meta")?,
    })
}

fn check_from_row(row: &SqliteRow) -> Result<StoredCheckResult> {
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let etl_stage: Option<String> = row.try_get("etl_stage")?;

    Ok(StoredCheckResult {
        validation_check_id: row.try_get("validation_check_id")?,
        validation_run_id: row.try_get("validation_run_id")?,
        result: CheckResult {
            check_name: row.try_get("check_name")?,
            rule_type: row.try_get("rule_type")?,
            etl_stage: etl_stage.as_deref().map(str::parse::<Stage>).transpose().map_err(|_| {
                Error::Internal(format!("Unknown etl_stage: {:?}", etl_stage))
            })?,
            status: status.parse()?,
            severity: row.try_get("severity")?,
            started_at: time::from_db(&started_at)?,
            finished_at: time::from_db_opt(row.try_get("finished_at")?)?,
            duration_ms: row.try_get("duration_ms")?,
            rows_failed: row.try_get("rows_failed")?,
            observed_value: row.try_get("observed_value")?,
            expected_value: row.try_get("expected_value")?,
            message: row.try_get("message")?,
            details: parse_json(row.try_get("details")?, "details")?,
        },
    })
}
