//! Process-scoped connection pool with transient-error retry.
//!
//! Lifecycle: `configure` (refused while a pool is live) → `get_pool`
//! (lazy connect on first call) → `shutdown` (drain). `with_retry` wraps a
//! database call in exponential backoff, applied only to transient error
//! classes.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Result, StoreError};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

const RETRY_INITIAL: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct PoolSlot {
    url: Option<String>,
    max_connections: u32,
    pool: Option<PgPool>,
}

fn slot() -> &'static Mutex<PoolSlot> {
    static SLOT: OnceLock<Mutex<PoolSlot>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(PoolSlot::default()))
}

/// Record the connection settings. Refused while a pool is live.
pub async fn configure(url: &str, max_connections: Option<u32>) -> Result<()> {
    let mut slot = slot().lock().await;
    if slot.pool.is_some() {
        return Err(StoreError::Conflict(
            "pool already configured and live; shutdown first".into(),
        ));
    }
    slot.url = Some(url.to_string());
    slot.max_connections = max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    Ok(())
}

/// The shared pool, connecting lazily on first use.
pub async fn get_pool() -> Result<PgPool> {
    let mut slot = slot().lock().await;
    if let Some(pool) = &slot.pool {
        return Ok(pool.clone());
    }
    let url = slot
        .url
        .clone()
        .ok_or_else(|| StoreError::Validation("pool not configured".into()))?;
    let pool = PgPoolOptions::new()
        .max_connections(slot.max_connections.max(1))
        .connect(&url)
        .await?;
    slot.pool = Some(pool.clone());
    Ok(pool)
}

/// Drain and close the pool; a later `configure` may start a new one.
pub async fn shutdown() {
    let pool = {
        let mut slot = slot().lock().await;
        slot.pool.take()
    };
    if let Some(pool) = pool {
        pool.close().await;
    }
}

/// Postgres error classes worth retrying: the connection went away or the
/// server shed load. Constraint, syntax, permission, and data errors are
/// deterministic and never retried.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // admin_shutdown, crash_shutdown, cannot_connect_now,
            // too_many_connections, idle_in_transaction_session_timeout
            Some("57P01") | Some("57P02") | Some("57P03") | Some("53300") | Some("25P03")
        ),
        _ => false,
    }
}

/// Run `op`, retrying transient failures with exponential backoff
/// (50 ms doubling to a 2 s cap, 3 attempts total).
pub async fn with_retry<T, F, Fut>(mut op: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut delay = RETRY_INITIAL;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_ATTEMPTS && is_transient(&err) => {
                warn!(%err, attempt, "transient database error; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_deterministic_errors() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
