//! Retry for transient SQLite lock contention
//!
//! WAL mode still serializes writers; a second process (or a long reader
//! checkpoint) can make a write fail with `SQLITE_BUSY`. Such failures are
//! retried with doubling backoff until the `database_lock_wait_ms` budget is
//! spent. Every other error is returned on the first attempt.

use bookmill_common::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Retries taking longer than this are logged at warn
const SLOW_RETRY: Duration = Duration::from_secs(2);

/// True for `SQLITE_BUSY` / `SQLITE_LOCKED` (including extended codes)
pub fn is_lock_error(err: &Error) -> bool {
    let Error::Database(sqlx::Error::Database(db_err)) = err else {
        return false;
    };
    match db_err.code() {
        Some(code) => code
            .parse::<i64>()
            .map(|c| matches!(c & 0xff, 5 | 6))
            .unwrap_or(false),
        None => {
            let msg = db_err.message();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run `operation`, retrying lock errors until `max_wait_ms` has elapsed
pub async fn retry_on_lock<F, Fut, T>(operation_name: &str, max_wait_ms: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let deadline = started + Duration::from_millis(max_wait_ms);
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    let elapsed = started.elapsed();
                    if elapsed > SLOW_RETRY {
                        tracing::warn!(operation = operation_name, attempt, elapsed_ms = elapsed.as_millis() as u64, "Database write needed a long retry");
                    } else {
                        tracing::debug!(operation = operation_name, attempt, "Database write succeeded after retry");
                    }
                }
                return Ok(value);
            }
            Err(err) if is_lock_error(&err) => err,
            Err(err) => return Err(err),
        };

        let now = Instant::now();
        if now >= deadline {
            tracing::error!(operation = operation_name, attempt, max_wait_ms, error = %err, "Giving up on locked database");
            return Err(Error::Internal(format!(
                "{}: database still locked after {} attempts over {} ms",
                operation_name,
                attempt,
                started.elapsed().as_millis()
            )));
        }

        let pause = backoff.min(deadline - now);
        tracing::warn!(operation = operation_name, attempt, backoff_ms = pause.as_millis() as u64, "Database locked, retrying");
        tokio::time::sleep(pause).await;

        backoff = (backoff * 2).min(MAX_BACKOFF);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_success_needs_one_attempt() {
        let result = retry_on_lock("test_op", 5000, || async { Ok::<i32, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);

        let result = retry_on_lock("test_op", 5000, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, Error>(Error::Concurrency("lost race".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Concurrency(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_text_outside_database_errors_ignored() {
        assert!(!is_lock_error(&Error::Internal("database is locked".to_string())));
        assert!(!is_lock_error(&Error::Database(sqlx::Error::RowNotFound)));
    }
}
