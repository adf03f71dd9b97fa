//! Batch status records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunStatus;

/// Processing state of one ETL layer for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub layer: String,
    pub parent_run_id: String,
    pub run_id: String,
    pub dag_id: Option<String>,
    pub status: RunStatus,
    /// Incremented once per `FAILED -> PROCESSING` retry
    pub attempts: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}
