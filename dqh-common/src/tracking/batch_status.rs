//! Batch status tracker
//!
//! One row per (layer, parent_run_id, run_id). `upsert` is a single
//! `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement, so the transition
//! check and the write happen atomically per key. The WHERE clause encodes
//! `RunStatus::batch_transition_allowed`; a rejected transition leaves the row
//! untouched and surfaces as `InvalidTransition`.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::db::retry_on_lock;
use crate::models::{BatchStatus, RunStatus};
use crate::time;
use crate::{Error, Result};

const BATCH_COLUMNS: &str = r#"
    dag_id, layer, parent_run_id, run_id, status, attempts, error_message,
    created_at, last_updated_at
"#;

#[derive(Clone)]
pub struct BatchStatusTracker {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl BatchStatusTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: 5000,
        }
    }

    pub fn with_max_lock_wait_ms(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    /// Create or advance the batch row for (layer, parent_run_id, run_id)
    ///
    /// New rows start with `attempts = 0`; every `FAILED -> PROCESSING` retry
    /// increments it by one. The returned row is the state this call wrote,
    /// even with concurrent writers.
    pub async fn upsert(
        &self,
        layer: &str,
        parent_run_id: &str,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<BatchStatus> {
        self.upsert_for_dag(None, layer, parent_run_id, run_id, status, error_message)
            .await
    }

    /// `upsert`, also stamping the orchestrating DAG id
    pub async fn upsert_for_dag(
        &self,
        dag_id: Option<&str>,
        layer: &str,
        parent_run_id: &str,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<BatchStatus> {
        retry_on_lock("upsert batch status", self.max_lock_wait_ms, || {
            self.try_upsert(dag_id, layer, parent_run_id, run_id, status, error_message)
        })
        .await
    }

    async fn try_upsert(
        &self,
        dag_id: Option<&str>,
        layer: &str,
        parent_run_id: &str,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<BatchStatus> {
        let now = time::to_db(&time::now());
        // Read-back shares the write's transaction
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO batch_status (
                dag_id, layer, parent_run_id, run_id, status, attempts,
                error_message, created_at, last_updated_at
            )
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT (layer, parent_run_id, run_id) DO UPDATE SET
                status = excluded.status,
                dag_id = COALESCE(excluded.dag_id, batch_status.dag_id),
                error_message = excluded.error_message,
                attempts = batch_status.attempts
                    + CASE WHEN batch_status.status = 'FAILED' AND excluded.status = 'PROCESSING'
                           THEN 1 ELSE 0 END,
                last_updated_at = excluded.last_updated_at
            WHERE batch_status.status = excluded.status
               OR (batch_status.status = 'NEW' AND excluded.status IN ('PROCESSING', 'SUCCESS', 'FAILED'))
               OR (batch_status.status = 'PROCESSING' AND excluded.status IN ('SUCCESS', 'FAILED'))
               OR (batch_status.status = 'FAILED' AND excluded.status = 'PROCESSING')
            "#,
        )
        .bind(dag_id)
        .bind(layer)
        .bind(parent_run_id)
        .bind(run_id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {} FROM batch_status WHERE layer = ? AND parent_run_id = ? AND run_id = ?",
            BATCH_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(layer)
            .bind(parent_run_id)
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        let current = row.as_ref().map(batch_from_row).transpose()?.ok_or_else(|| {
            Error::Internal(format!(
                "batch status {}/{}/{} missing after upsert",
                layer, parent_run_id, run_id
            ))
        })?;

        if result.rows_affected() == 0 {
            warn!(
                layer,
                run_id,
                parent_run_id,
                from = %current.status,
                to = %status,
                "Rejected batch status transition"
            );
            return Err(Error::InvalidTransition {
                layer: layer.to_string(),
                run_id: run_id.to_string(),
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        info!(
            layer,
            run_id,
            parent_run_id,
            status = %current.status,
            attempts = current.attempts,
            "Batch status updated"
        );

        Ok(current)
    }

    /// Row for the exact composite key
    pub async fn get_exact(
        &self,
        layer: &str,
        parent_run_id: &str,
        run_id: &str,
    ) -> Result<Option<BatchStatus>> {
        let sql = format!(
            "SELECT {} FROM batch_status WHERE layer = ? AND parent_run_id = ? AND run_id = ?",
            BATCH_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(layer)
            .bind(parent_run_id)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(batch_from_row).transpose()
    }

    /// Most recently updated row for (layer, run_id)
    pub async fn get(&self, layer: &str, run_id: &str) -> Result<BatchStatus> {
        let sql = format!(
            "SELECT {} FROM batch_status WHERE layer = ? AND run_id = ? \
             ORDER BY last_updated_at DESC, batch_status_id DESC LIMIT 1",
            BATCH_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(layer)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => batch_from_row(&row),
            None => Err(Error::NotFound(format!("batch status {}/{}", layer, run_id))),
        }
    }

    /// Rows of a layer in the given status, oldest first (polling consumers)
    pub async fn list_by_status(&self, layer: &str, status: RunStatus) -> Result<Vec<BatchStatus>> {
        let sql = format!(
            "SELECT {} FROM batch_status WHERE layer = ? AND status = ? \
             ORDER BY created_at, batch_status_id",
            BATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(layer)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(batch_from_row).collect()
    }

    /// Atomically create NEW `target_layer` rows for every SUCCESS row of
    /// `source_layer` that has no SUCCESS/PROCESSING downstream row yet
    ///
    /// Returns the claimed source run ids (the new rows' parents).
    pub async fn claim_pending(
        &self,
        dag_id: Option<&str>,
        source_layer: &str,
        target_layer: &str,
        target_run_id: &str,
    ) -> Result<Vec<String>> {
        let now = time::to_db(&time::now());
        let claimed: Vec<String> = sqlx::query_scalar(
            r#"
            INSERT INTO batch_status (
                dag_id, layer, parent_run_id, run_id, status, attempts,
                created_at, last_updated_at
            )
            SELECT ?, ?, s.run_id, ?, 'NEW', 0, ?, ?
            FROM batch_status s
            WHERE s.layer = ? AND s.status = 'SUCCESS'
              AND NOT EXISTS (
                  SELECT 1 FROM batch_status d
                  WHERE d.layer = ? AND d.parent_run_id = s.run_id
                    AND d.status IN ('SUCCESS', 'PROCESSING')
              )
            ORDER BY s.created_at
            ON CONFLICT (layer, parent_run_id, run_id) DO NOTHING
            RETURNING parent_run_id
            "#,
        )
        .bind(dag_id)
        .bind(target_layer)
        .bind(target_run_id)
        .bind(&now)
        .bind(&now)
        .bind(source_layer)
        .bind(target_layer)
        .fetch_all(&self.pool)
        .await?;

        info!(
            source_layer,
            target_layer,
            target_run_id,
            claimed = claimed.len(),
            "Claimed pending batches"
        );
        Ok(claimed)
    }

    /// Experiment runs derived from a baseline, in creation order
    pub async fn experiments_of(&self, baseline_run_id: &str) -> Result<Vec<String>> {
        let runs: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT run_id FROM batch_status
            WHERE parent_run_id = ? AND run_id <> ?
            GROUP BY run_id
            ORDER BY MIN(created_at), run_id
            "#,
        )
        .bind(baseline_run_id)
        .bind(baseline_run_id)
        .fetch_all(&self.pool)
        .await?;

        debug!(baseline_run_id, experiments = runs.len(), "Resolved experiment runs");
        Ok(runs)
    }

    /// Whether any batch row records `run_id` as derived from `parent_run_id`
    pub async fn is_derived_from(&self, run_id: &str, parent_run_id: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM batch_status WHERE run_id = ? AND parent_run_id = ?)",
        )
        .bind(run_id)
        .bind(parent_run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(found)
    }

    /// Remove batch rows of a layer before an experiment is repeated
    pub async fn delete_for_layer(&self, layer: &str, run_ids: Option<&[String]>) -> Result<u64> {
        let mut sql = String::from("DELETE FROM batch_status WHERE layer = ?");
        if let Some(ids) = run_ids {
            if ids.is_empty() {
                return Ok(0);
            }
            sql.push_str(&format!(" AND run_id IN ({})", vec!["?"; ids.len()].join(", ")));
        }

        let mut query = sqlx::query(&sql).bind(layer);
        for id in run_ids.unwrap_or_default() {
            query = query.bind(id);
        }

        let deleted = query.execute(&self.pool).await?.rows_affected();
        info!(layer, deleted, "Deleted batch status rows for repeat");
        Ok(deleted)
    }
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchStatus> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let last_updated_at: String = row.try_get("last_updated_at")?;

    Ok(BatchStatus {
        layer: row.try_get("layer")?,
        parent_run_id: row.try_get("parent_run_id")?,
        run_id: row.try_get("run_id")?,
        dag_id: row.try_get("dag_id")?,
        status: status.parse()?,
        attempts: row.try_get("attempts")?,
        error_message: row.try_get("error_message")?,
        created_at: time::from_db(&created_at)?,
        last_updated_at: time::from_db(&last_updated_at)?,
    })
}
