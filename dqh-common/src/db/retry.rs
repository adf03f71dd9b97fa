//! Lock retry for the bookkeeping database
//!
//! Exponential backoff for transient SQLite lock contention. Parallel tool
//! adapters write to the same bookkeeping database; a writer that loses the
//! lock race retries here instead of failing the tool execution.
//!
//! Only lock errors are retried. Contract errors (`DuplicateRun`,
//! `InvalidState`, ...) and every other database error return immediately.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::{Error, Result};

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 1000;
/// Successful retries slower than this are logged at warn level
const SLOW_RETRY_MS: u128 = 2000;

/// Run `operation` until it stops failing with a lock error or `max_wait_ms`
/// has elapsed
///
/// Backoff starts at 10 ms and doubles up to 1 s between attempts.
/// `operation_name` only labels log lines and the final error.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let deadline = Duration::from_millis(max_wait_ms);
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                let waited_ms = started.elapsed().as_millis();
                if attempt > 1 && waited_ms > SLOW_RETRY_MS {
                    warn!(operation = operation_name, attempt, waited_ms, "Lock cleared after a long wait");
                } else if attempt > 1 {
                    debug!(operation = operation_name, attempt, waited_ms, "Lock cleared");
                }
                return Ok(value);
            }
            Err(err) if err.is_lock_error() => err,
            Err(err) => return Err(err),
        };

        let waited = started.elapsed();
        if waited >= deadline {
            error!(
                operation = operation_name,
                attempt,
                waited_ms = waited.as_millis(),
                max_wait_ms,
                error = %err,
                "Giving up on locked database"
            );
            return Err(Error::Internal(format!(
                "{}: database locked after {} attempts ({} ms elapsed, max {} ms)",
                operation_name,
                attempt,
                waited.as_millis(),
                max_wait_ms
            )));
        }

        debug!(operation = operation_name, attempt, backoff_ms, "Database locked; backing off");
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_error() -> Error {
        Error::Database(sqlx::Error::Protocol("database is locked".to_string()))
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let result = retry_on_lock("test_op", 5000, || async { Ok::<i32, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_lock_errors() {
        let mut attempts = 0;

        let result = retry_on_lock("test_op", 5000, || {
            attempts += 1;
            let current = attempts;
            async move {
                if current < 3 {
                    Err(lock_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_wait() {
        let result = retry_on_lock("test_op", 30, || async { Err::<i32, Error>(lock_error()) }).await;

        match result {
            Err(Error::Internal(msg)) => assert!(msg.contains("database locked")),
            other => panic!("expected Internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contract_error_fails_immediately() {
        let mut attempts = 0;

        let result = retry_on_lock("test_op", 5000, || {
            attempts += 1;
            async move { Err::<i32, Error>(Error::Conflict("already closed".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(attempts, 1);
    }
}
