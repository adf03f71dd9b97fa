//! Database initialization
//!
//! Creates the bookkeeping tables on first run and upgrades older databases.
//! Three phases, all idempotent:
//! 1. CREATE TABLE / INDEX IF NOT EXISTS
//! 2. Versioned migrations (`migrations.rs`)
//! 3. Connection pragmas (foreign keys, WAL, busy timeout) on every connection

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::Result;

/// Initialize database connection with default settings
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    init_database_with(db_path, &DatabaseConfig::default()).await
}

/// Initialize database connection and create tables if needed
pub async fn init_database_with(db_path: &Path, config: &DatabaseConfig) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Pragmas set through connect options apply to every pooled connection;
    // foreign keys must be on for check results to cascade with their run.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema_version_table(&pool).await?;
    create_batch_status_table(&pool).await?;
    create_validation_run_table(&pool).await?;
    create_validation_check_result_table(&pool).await?;
    create_etl_load_audit_table(&pool).await?;

    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the batch_status table
///
/// One row per (layer, parent_run_id, run_id). The (layer, status) index backs
/// the "find work in NEW or FAILED" polling pattern.
pub async fn create_batch_status_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_status (
            batch_status_id INTEGER PRIMARY KEY AUTOINCREMENT,
            dag_id TEXT,
            layer TEXT NOT NULL,
            parent_run_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('NEW', 'PROCESSING', 'SUCCESS', 'FAILED')),
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            error_message TEXT,
            created_at TEXT NOT NULL,
            last_updated_at TEXT NOT NULL,
            UNIQUE (layer, parent_run_id, run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batch_status_layer_status ON batch_status(layer, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_batch_status_parent ON batch_status(parent_run_id, run_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the validation_run table
///
/// The partial unique index allows at most one non-terminal run per
/// (run_id, layer, tool); `open` relies on it for compare-and-insert.
pub async fn create_validation_run_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validation_run (
            validation_run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            dag_id TEXT,
            run_id TEXT NOT NULL,
            parent_run_id TEXT,
            layer TEXT NOT NULL,
            tool TEXT NOT NULL,
            suite TEXT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('NEW', 'PROCESSING', 'SUCCESS', 'FAILED')),
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_ms INTEGER,
            checks_total INTEGER NOT NULL DEFAULT 0,
            checks_failed INTEGER NOT NULL DEFAULT 0,
            rows_checked INTEGER,
            rows_failed INTEGER NOT NULL DEFAULT 0,
            report_path TEXT,
            config_hash TEXT,
            meta TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_validation_run_active
        ON validation_run(run_id, layer, tool)
        WHERE status IN ('NEW', 'PROCESSING')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_validation_run_key ON validation_run(run_id, layer, tool)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the validation_check_result table (cascade-deleted with its run)
pub async fn create_validation_check_result_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validation_check_result (
            validation_check_id INTEGER PRIMARY KEY AUTOINCREMENT,
            validation_run_id INTEGER NOT NULL
                REFERENCES validation_run(validation_run_id) ON DELETE CASCADE,
            check_name TEXT NOT NULL,
            rule_type TEXT,
            etl_stage TEXT,
            status TEXT NOT NULL CHECK (status IN ('PASS', 'WARN', 'FAIL', 'ERROR', 'SKIP')),
            severity TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_ms INTEGER,
            rows_failed INTEGER CHECK (rows_failed IS NULL OR rows_failed >= 0),
            observed_value TEXT,
            expected_value TEXT,
            message TEXT,
            details TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_check_result_run_check
        ON validation_check_result(validation_run_id, check_name)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the etl_load_audit table (append-only)
pub async fn create_etl_load_audit_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS etl_load_audit (
            audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
            dag_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            task_id TEXT,
            layer TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            rows_processed INTEGER,
            message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_etl_load_audit_run_layer ON etl_load_audit(run_id, layer)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
