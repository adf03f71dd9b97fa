//! Schema upgrades for harness databases
//!
//! Applied after the base tables exist. Each `migrate_vN` runs once per
//! database, recorded in `schema_version`, and must tolerate running against a
//! database where another process already applied it. Shipped migrations are
//! append-only.

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::Result;

/// Version a freshly initialized database ends up at
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Highest applied version, 0 for a database with no recorded migrations
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Bring the schema up to `CURRENT_SCHEMA_VERSION`
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!(version = current_version, "Harness schema current");
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            db_version = current_version,
            code_version = CURRENT_SCHEMA_VERSION,
            "Harness database was written by a newer dqh; leaving schema as is"
        );
        return Ok(());
    }

    info!(
        from = current_version,
        to = CURRENT_SCHEMA_VERSION,
        "Upgrading harness schema"
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    Ok(())
}

/// Migration v1: Add message column to validation_run
///
/// Holds the close message of a run (failure reason, timeout or cancellation
/// notice from an external watchdog).
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: Add message column to validation_run");

    let has_column: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('validation_run') WHERE name = 'message'",
    )
    .fetch_one(pool)
    .await?;

    if has_column > 0 {
        info!("  message column already exists - skipping");
        return Ok(());
    }

    match sqlx::query("ALTER TABLE validation_run ADD COLUMN message TEXT")
        .execute(pool)
        .await
    {
        Ok(_) => {
            info!("  Added message column to validation_run");
            Ok(())
        }
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("duplicate column") => {
            // Concurrent initializer got there first
            info!("  message column added concurrently - skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Migration v2: Index check results by status
///
/// Backs the FAIL-count reconciliation between runs and their check results.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: Index validation_check_result by status");

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_check_result_run_status
        ON validation_check_result(validation_run_id, status)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
