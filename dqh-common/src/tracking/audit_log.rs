//! ETL load audit log
//!
//! Append-only. Rows are never updated; a task reports STARTED and later a
//! terminal status as two separate entries.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::models::{AuditEntry, AuditEvent, AuditStatus, EntityTiming};
use crate::time;
use crate::{Error, Result};

#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one audit entry, returning its `audit_id`
    ///
    /// `rows_processed` is stored only for SUCCESS entries. Terminal statuses
    /// get `finished_at = now` unless the event carries one.
    pub async fn record(&self, event: &AuditEvent) -> Result<i64> {
        if event.run_id.trim().is_empty() || event.entity_name.trim().is_empty() {
            return Err(Error::InvalidInput(
                "audit run_id and entity_name must not be empty".to_string(),
            ));
        }

        let now = time::now();
        let started_at = event.started_at.unwrap_or(now);
        let finished_at = match event.finished_at {
            Some(at) => Some(at),
            None if event.status.is_terminal() => Some(now),
            None => None,
        };
        let rows_processed = match event.status {
            AuditStatus::Success => event.rows_processed,
            _ => None,
        };

        if let Some(task_id) = &event.task_id {
            self.warn_if_started_regresses(&event.run_id, task_id, &started_at)
                .await?;
        }

        let audit_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO etl_load_audit (
                dag_id, run_id, task_id, layer, entity_name, status,
                started_at, finished_at, rows_processed, message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING audit_id
            "#,
        )
        .bind(&event.dag_id)
        .bind(&event.run_id)
        .bind(&event.task_id)
        .bind(&event.layer)
        .bind(&event.entity_name)
        .bind(event.status.as_str())
        .bind(time::to_db(&started_at))
        .bind(finished_at.as_ref().map(time::to_db))
        .bind(rows_processed)
        .bind(&event.message)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            audit_id,
            run_id = %event.run_id,
            layer = %event.layer,
            entity = %event.entity_name,
            status = %event.status,
            "Audit entry recorded"
        );

        Ok(audit_id)
    }

    // Diagnostic only: out-of-order task clocks are logged, never rejected.
    async fn warn_if_started_regresses(
        &self,
        run_id: &str,
        task_id: &str,
        started_at: &chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT MAX(started_at) FROM etl_load_audit WHERE run_id = ? AND task_id = ?",
        )
        .bind(run_id)
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;

        if let Some(latest) = latest {
            let latest = time::from_db(&latest)?;
            if *started_at < latest {
                warn!(
                    run_id,
                    task_id,
                    started_at = %time::to_db(started_at),
                    latest = %time::to_db(&latest),
                    "Audit started_at went backwards for task"
                );
            }
        }
        Ok(())
    }

    /// Entries of a run and layer in insertion order
    pub async fn list(&self, run_id: &str, layer: &str) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT audit_id, dag_id, run_id, task_id, layer, entity_name, status,
                   started_at, finished_at, rows_processed, message
            FROM etl_load_audit
            WHERE run_id = ? AND layer = ?
            ORDER BY audit_id
            "#,
        )
        .bind(run_id)
        .bind(layer)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Seconds spent per entity for finished (SUCCESS/FAILED) entries
    pub async fn timing_summary(&self, run_id: &str, layer: &str) -> Result<Vec<EntityTiming>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_name,
                   COUNT(*) AS tasks,
                   SUM((julianday(finished_at) - julianday(started_at)) * 86400.0) AS seconds_sum
            FROM etl_load_audit
            WHERE run_id = ? AND layer = ?
              AND status IN ('SUCCESS', 'FAILED')
              AND finished_at IS NOT NULL
            GROUP BY entity_name
            ORDER BY entity_name
            "#,
        )
        .bind(run_id)
        .bind(layer)
        .fetch_all(&self.pool)
        .await?;

        let mut timings = Vec::with_capacity(rows.len());
        for row in &rows {
            let seconds_sum: Option<f64> = row.try_get("seconds_sum")?;
            timings.push(EntityTiming {
                run_id: run_id.to_string(),
                layer: layer.to_string(),
                entity_name: row.try_get("entity_name")?,
                tasks: row.try_get("tasks")?,
                seconds_sum: seconds_sum.unwrap_or(0.0),
            });
        }
        Ok(timings)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;

    Ok(AuditEntry {
        audit_id: row.try_get("audit_id")?,
        dag_id: row.try_get("dag_id")?,
        run_id: row.try_get("run_id")?,
        task_id: row.try_get("task_id")?,
        layer: row.try_get("layer")?,
        entity_name: row.try_get("entity_name")?,
        status: status.parse()?,
        started_at: time::from_db(&started_at)?,
        finished_at: time::from_db_opt(row.try_get("finished_at")?)?,
        rows_processed: row.try_get("rows_processed")?,
        message: row.try_get("message")?,
    })
}
