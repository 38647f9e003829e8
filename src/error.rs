//! Error types for the PostgreSQL client.

use std::collections::HashMap;
use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during communication. The connection is considered broken.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server sent a message that violates the protocol state machine.
    /// The connection is considered corrupt.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Parameter encoding or row decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The server refused the SSLRequest probe.
    #[error("server refused SSL")]
    SslRefused,

    /// The server asked for an authentication method this client does not
    /// implement (scram-sha-256, kerberos, gss, sspi).
    #[error("unimplemented authentication method: {0}")]
    Unimplemented(&'static str),

    /// The server returned an ErrorResponse. Field values are keyed by
    /// their single-byte field codes exactly as received on the wire
    /// (b'S' severity, b'C' sqlstate, b'M' message, ...).
    #[error("server error: {}", server_error_summary(.fields))]
    Server { fields: HashMap<u8, String> },

    /// Checkout timed out waiting for a connection.
    #[error("timed out waiting for a pool connection")]
    PoolTimeout,

    /// Checkout with queueing disabled found no connection available.
    #[error("pool has no available connections")]
    PoolFull,

    /// The pool has been shut down.
    #[error("pool is closed")]
    PoolClosed,

    /// No pool is registered under the given name.
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    /// A query named a pool other than the one the enclosing transaction
    /// is bound to.
    #[error("query targets pool {0:?} inside a transaction on another pool")]
    InOtherPoolTransaction(String),

    /// The connection is closed or in an unusable state.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Invalid connection or pool configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The SQLSTATE code of a server error, if this is one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server { fields } => fields.get(&b'C').map(|s| s.as_str()),
            _ => None,
        }
    }

    /// Whether this error leaves the connection unusable.
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::UnexpectedMessage(_) | Error::ConnectionClosed
        )
    }
}

fn server_error_summary(fields: &HashMap<u8, String>) -> String {
    let severity = fields.get(&b'S').map(|s| s.as_str()).unwrap_or("ERROR");
    let code = fields.get(&b'C').map(|s| s.as_str()).unwrap_or("?????");
    let message = fields.get(&b'M').map(|s| s.as_str()).unwrap_or("");
    format!("{severity}: {message} ({code})")
}
