//! Common error types for the harness

use thiserror::Error;

/// Common result type for harness operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every tracker
///
/// The contract variants (`DuplicateRun`, `InvalidState`, `Conflict`,
/// `InvalidTransition`, `NotFound`) are raised synchronously to the caller and
/// are never retried by the core.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input (malformed check result, bad run pairing)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error (corrupt persisted value, serialization failure)
    #[error("Internal error: {0}")]
    Internal(String),

    /// A non-terminal validation run already exists for the key
    #[error("Duplicate run: {run_id}/{layer}/{tool} is already open (validation_run_id {existing})")]
    DuplicateRun {
        run_id: String,
        layer: String,
        tool: String,
        existing: i64,
    },

    /// Write attempted against a run that is not accepting it
    #[error("Invalid state: validation run {validation_run_id} is {status}, expected {expected}")]
    InvalidState {
        validation_run_id: i64,
        status: String,
        expected: String,
    },

    /// Re-close (or duplicate check) that disagrees with what is recorded
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Batch status transition not allowed by the lifecycle
    #[error("Invalid transition for {layer}/{run_id}: {from} -> {to}")]
    InvalidTransition {
        layer: String,
        run_id: String,
        from: String,
        to: String,
    },
}

impl Error {
    /// True for SQLite "database is locked"/busy errors
    pub fn is_lock_error(&self) -> bool {
        match self {
            Error::Database(db_err) => {
                let msg = db_err.to_string();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            _ => false,
        }
    }
}
