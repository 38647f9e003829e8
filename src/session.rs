//! Ambient connection binding and the caller-facing query API.
//!
//! `transaction` and `with_conn` bind a checked-out connection to the
//! current task scope so nested `query` calls run on the same backend
//! session without threading a handle through every call. The binding
//! is task-local, single-writer, and restored on every exit path,
//! including panics.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::debug;

use crate::connection::QueryResult;
use crate::error::{Error, Result};
use crate::pool::{lookup_pool, CheckoutOpts, ConnHandle, Pool, PoolRef};
use crate::types::PgValue;

/// Pool used when none is named.
pub const DEFAULT_POOL: &str = "default";

#[derive(Clone)]
struct Ambient {
    pool_name: String,
    handle: ConnHandle,
}

tokio::task_local! {
    static AMBIENT: Ambient;
}

fn ambient() -> Option<Ambient> {
    AMBIENT.try_with(|a| a.clone()).ok()
}

/// The pool name of the transaction the current task is inside, if any.
pub fn current_transaction_pool() -> Option<String> {
    ambient().map(|a| a.pool_name)
}

// ============================================================================
// Query API
// ============================================================================

/// Options for a single `query` call.
#[derive(Debug, Clone)]
pub struct QueryOpts {
    /// Pool to run on; `default` when unset. Inside a transaction the
    /// ambient connection is used, and naming a different pool is an
    /// error.
    pub pool: Option<String>,
    /// Whether checkout may queue when the pool is at size
    pub queue: bool,
    /// Checkout wait limit override
    pub timeout: Option<Duration>,
    /// Return rows as column-name maps instead of tuples
    pub rows_as_maps: bool,
}

impl Default for QueryOpts {
    fn default() -> Self {
        Self {
            pool: None,
            queue: true,
            timeout: None,
            rows_as_maps: false,
        }
    }
}

/// Run a query with no parameters on the default pool (or the ambient
/// transaction connection).
pub async fn query(sql: &str) -> Result<QueryResult> {
    query_opts(sql, &[], QueryOpts::default()).await
}

/// Run a parameterized query on the default pool (or the ambient
/// transaction connection).
pub async fn query_with(sql: &str, params: &[PgValue]) -> Result<QueryResult> {
    query_opts(sql, params, QueryOpts::default()).await
}

/// Run a parameterized query with explicit options.
pub async fn query_opts(sql: &str, params: &[PgValue], opts: QueryOpts) -> Result<QueryResult> {
    if let Some(ambient) = ambient() {
        // Naming a pool other than the transaction's fails before any
        // connection is touched
        if let Some(requested) = &opts.pool {
            if *requested != ambient.pool_name {
                return Err(Error::InOtherPoolTransaction(requested.clone()));
            }
        }
        let mut conn = ambient.handle.lock().await;
        return conn.extended_query(sql, params, opts.rows_as_maps).await;
    }

    let pool_name = opts.pool.as_deref().unwrap_or(DEFAULT_POOL);
    let pool = lookup_pool(pool_name)?;
    let (pool_ref, handle) = pool
        .checkout(CheckoutOpts {
            queue: opts.queue,
            timeout: opts.timeout,
        })
        .await?;

    debug!(
        target: "pgkit::session",
        pool = pool_name,
        queue_time_us = pool_ref.queue_time().as_micros() as u64,
        "executing query"
    );

    let result = {
        let mut conn = handle.lock().await;
        conn.extended_query(sql, params, opts.rows_as_maps).await
    };
    pool.checkin(pool_ref, handle).await;
    result
}

// ============================================================================
// Checkout API
// ============================================================================

/// Check a connection out of a named pool.
pub async fn checkout(pool: &str) -> Result<(PoolRef, ConnHandle)> {
    checkout_opts(pool, CheckoutOpts::default()).await
}

/// Check a connection out of a named pool with explicit options.
pub async fn checkout_opts(pool: &str, opts: CheckoutOpts) -> Result<(PoolRef, ConnHandle)> {
    lookup_pool(pool)?.checkout(opts).await
}

/// Return a checked-out connection to its pool.
pub async fn checkin(pool_ref: PoolRef, handle: ConnHandle) {
    let pool = pool_ref.pool().clone();
    pool.checkin(pool_ref, handle).await;
}

/// Forcibly tear down a checked-out connection.
pub async fn break_conn(pool_ref: PoolRef, handle: ConnHandle) {
    let pool = pool_ref.pool().clone();
    pool.break_conn(pool_ref, handle).await;
}

// ============================================================================
// Transactions
// ============================================================================

/// Options for `transaction_in`.
#[derive(Debug, Clone)]
pub struct TransactionOpts {
    /// Whether checkout may queue when the pool is at size
    pub queue: bool,
    /// Checkout wait limit override
    pub timeout: Option<Duration>,
}

impl Default for TransactionOpts {
    fn default() -> Self {
        Self {
            queue: true,
            timeout: None,
        }
    }
}

/// Run `f` inside a scope where `handle` is the ambient connection.
///
/// The previous binding, if any, is restored on every exit path.
pub async fn with_conn<F, Fut, T>(handle: &ConnHandle, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let pool_name = {
        let conn = handle.lock().await;
        conn.pool_name().to_string()
    };
    let ambient = Ambient {
        pool_name,
        handle: handle.clone(),
    };
    AMBIENT.scope(ambient, f()).await
}

/// Run `f` inside a transaction on the default pool.
pub async fn transaction<F, Fut, T, E>(f: F) -> std::result::Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    transaction_in(DEFAULT_POOL, f, TransactionOpts::default()).await
}

/// Run `f` inside a transaction on a named pool.
///
/// A connection is checked out and bound as ambient for the duration of
/// `f`; every `query` inside runs on it. `BEGIN`/`COMMIT` bracket the
/// body. Any failure (from the body, `BEGIN`, or `COMMIT`) triggers a
/// best-effort `ROLLBACK`, the connection is checked in, and the
/// original failure is re-raised, panics included. Inside an existing
/// transaction the body is inlined; there are no savepoints.
pub async fn transaction_in<F, Fut, T, E>(
    pool: &str,
    f: F,
    opts: TransactionOpts,
) -> std::result::Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
{
    if ambient().is_some() {
        // Nested transactions run inline on the outer connection
        return f().await;
    }

    let pool = lookup_pool(pool).map_err(E::from)?;
    let (pool_ref, handle) = pool
        .checkout(CheckoutOpts {
            queue: opts.queue,
            timeout: opts.timeout,
        })
        .await
        .map_err(E::from)?;

    let begin_result = {
        let mut conn = handle.lock().await;
        conn.begin().await
    };
    if let Err(e) = begin_result {
        rollback_and_checkin(&pool, pool_ref, handle).await;
        return Err(E::from(e));
    }

    let ambient = Ambient {
        pool_name: pool.name().to_string(),
        handle: handle.clone(),
    };
    let body = AssertUnwindSafe(AMBIENT.scope(ambient, f()))
        .catch_unwind()
        .await;

    match body {
        Ok(Ok(value)) => {
            let commit_result = {
                let mut conn = handle.lock().await;
                conn.commit().await
            };
            match commit_result {
                Ok(()) => {
                    pool.checkin(pool_ref, handle).await;
                    Ok(value)
                }
                Err(e) => {
                    rollback_and_checkin(&pool, pool_ref, handle).await;
                    Err(E::from(e))
                }
            }
        }
        Ok(Err(e)) => {
            rollback_and_checkin(&pool, pool_ref, handle).await;
            Err(e)
        }
        Err(panic) => {
            rollback_and_checkin(&pool, pool_ref, handle).await;
            std::panic::resume_unwind(panic);
        }
    }
}

/// Best-effort rollback before returning a connection; its own error is
/// ignored, and a connection the rollback broke is discarded by checkin.
async fn rollback_and_checkin(pool: &Pool, pool_ref: PoolRef, handle: ConnHandle) {
    {
        let mut conn = handle.lock().await;
        let _ = conn.rollback().await;
    }
    pool.checkin(pool_ref, handle).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_opts_defaults() {
        let opts = QueryOpts::default();
        assert!(opts.pool.is_none());
        assert!(opts.queue);
        assert!(opts.timeout.is_none());
        assert!(!opts.rows_as_maps);
    }

    #[tokio::test]
    async fn test_no_ambient_outside_transaction() {
        assert!(current_transaction_pool().is_none());
    }

    #[tokio::test]
    async fn test_query_on_unknown_pool() {
        let err = query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, Error::UnknownPool(name) if name == DEFAULT_POOL));
    }
}
