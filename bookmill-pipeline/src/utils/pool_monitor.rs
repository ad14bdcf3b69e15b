//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a connection was waited for
//! and held, to diagnose lock contention on a book database.

use bookmill_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::Instant;

/// Monitored transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl MonitoredTransaction {
    /// Connection for running statements inside the transaction
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(Error::Internal(format!(
                "{}: transaction already finished",
                self.caller
            ))),
        }
    }

    /// Commit the transaction and log release timing
    pub async fn commit(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            Error::Internal(format!("{}: transaction already finished", self.caller))
        })?;
        tx.commit().await?;

        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                "LONG TRANSACTION - connection held for extended period"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, "Connection released (commit)");
        }

        Ok(())
    }
}

impl Drop for MonitoredTransaction {
    fn drop(&mut self) {
        // Still holding the transaction means an error path: sqlx rolls it back
        if self.tx.is_some() {
            let held_ms = self.acquired_at.elapsed().as_millis();
            tracing::debug!(
                caller = self.caller,
                held_ms,
                "Connection released (drop, rolled back)"
            );
        }
    }
}

/// Begin a monitored transaction with connection pool timing logs
pub async fn begin_monitored(
    pool: &SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction> {
    let start = Instant::now();

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - book pool may be saturated"
        );
    } else {
        tracing::trace!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx: Some(tx),
        caller,
        acquired_at: Instant::now(),
    })
}
