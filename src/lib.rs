//! PostgreSQL wire protocol client with pooling and ambient transactions.
//!
//! This crate speaks the PostgreSQL frontend/backend protocol (v3.0)
//! directly:
//! - Binary-format parameters and results over the extended query protocol
//! - A bounded, named connection pool with strict-FIFO checkout queueing
//! - Task-scoped transactions: `query` calls inside a `transaction` body
//!   run on the transaction's connection without passing a handle around
//!
//! Architecture:
//! - `protocol`: low-level wire message encoding/decoding
//! - `types`: type OIDs, binary codecs, and the refreshable type registry
//! - `connection`: handshake, simple and extended query state machines
//! - `pool`: named bounded pools with checkout/checkin and breakage
//! - `session`: ambient connection binding, transactions, public query API
//!
//! # Example
//!
//! ```rust,ignore
//! use pgkit::{start_pool, query_with, transaction, PgValue, PoolConfig};
//!
//! start_pool("default", PoolConfig::from_url("postgresql://app:pw@localhost/app")?.size(8))?;
//!
//! let result = query_with("SELECT $1::text", &[PgValue::from("hello")]).await?;
//! assert_eq!(result.num_rows, 1);
//!
//! transaction(|| async {
//!     query_with("INSERT INTO t VALUES ($1)", &[PgValue::from(1)]).await?;
//!     query_with("INSERT INTO t VALUES ($1)", &[PgValue::from(2)]).await?;
//!     Ok::<_, pgkit::Error>(())
//! })
//! .await?;
//! ```

pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod types;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use connection::{
    ConnectConfig, Connection, Notification, QueryResult, Row, SslMode, TlsUpgrade,
};
pub use error::{Error, Result};
pub use pool::{
    lookup_pool, start_pool, stop_pool, CheckoutOpts, ConnHandle, Pool, PoolConfig, PoolRef,
};
pub use protocol::{Command, CommandTag, FieldDescription, TransactionStatus};
pub use session::{
    break_conn, checkin, checkout, checkout_opts, current_transaction_pool, query, query_opts,
    query_with, transaction, transaction_in, with_conn, QueryOpts, TransactionOpts, DEFAULT_POOL,
};
pub use types::{
    bind_requires_statement_description, Oid, OidRefresh, PgValue, TypeCodec, TypeInfo,
    TypeRegistry,
};
