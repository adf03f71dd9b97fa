//! # DQH Common Library
//!
//! Bookkeeping and scoring core of the data-quality harness:
//! - Database initialization, migrations and lock retry
//! - Validation run, batch status and audit trackers
//! - Tool adapter interface and the per-stage runner
//! - Baseline/experiment comparison and the flat summary export
//! - Configuration loading

pub mod adapters;
pub mod comparison;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod time;
pub mod tracking;

pub use error::{Error, Result};
pub use models::{CheckResult, CheckStatus, RunMode, RunStatus, Stage};

use sqlx::SqlitePool;

use crate::config::HarnessConfig;
use crate::tracking::{AuditLog, BatchStatusTracker, ValidationRunTracker};

/// Handles onto every tracker, sharing one connection pool
#[derive(Clone)]
pub struct Harness {
    pub pool: SqlitePool,
    pub validation_runs: ValidationRunTracker,
    pub batches: BatchStatusTracker,
    pub audit: AuditLog,
}

impl Harness {
    /// Open (or create) the harness database described by `config`
    pub async fn open(config: &HarnessConfig) -> Result<Self> {
        let pool = db::init_database_with(&config.database.path, &config.database).await?;
        Ok(Self::from_pool(pool, config))
    }

    /// Build trackers over an already initialized pool
    pub fn from_pool(pool: SqlitePool, config: &HarnessConfig) -> Self {
        let max_wait = config.database.max_lock_wait_ms;
        Self {
            validation_runs: ValidationRunTracker::new(pool.clone(), config.tracker.clone())
                .with_max_lock_wait_ms(max_wait),
            batches: BatchStatusTracker::new(pool.clone()).with_max_lock_wait_ms(max_wait),
            audit: AuditLog::new(pool.clone()),
            pool,
        }
    }
}
