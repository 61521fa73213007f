// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// The error type for handle and connection pool operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection handle is unusable until it is reconnected.
    #[error("connection is bad: {0}")]
    ConnectionBad(String),
    /// No connection is available and the pool may not create or wait for
    /// another one.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// An I/O context rebind was attempted while connections were checked
    /// out of the pool.
    #[error("cannot rebind I/O context: {0} connections checked out")]
    RebindConflict(u32),
    /// A deadline expired before an operation completed.
    #[error("operation timed out")]
    Timeout,
    /// The native connection was closed or detached from the handle.
    #[error("connection handle has been released")]
    HandleReleased,
    /// The connection pool has been stopped.
    #[error("connection pool is not running")]
    PoolStopped,
    /// `stop` was invoked on a clone rather than the original pool.
    #[error("stop may only be called by the original connection pool")]
    StopCalledByClone,
    /// A custom type could not be found in the connection's type catalog.
    #[error("no type oid found for custom type {0}")]
    UnresolvedType(String),
    #[error("invalid connection pool configuration: {0}")]
    InvalidConfiguration(String),
    /// The native driver could not establish a connection.
    #[error("failed to establish connection: {0}")]
    ConnectFailure(String),
    /// An operation reported an error from the native driver.
    #[error("driver error: {0}")]
    Driver(String),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A custom type was assigned an OID that already belongs to another
    /// type in the map.
    #[error("type {name} cannot take oid {oid}, already assigned to {existing}")]
    TypeOidConflict {
        name: String,
        oid: u32,
        existing: String,
    },
}

impl Error {
    /// A stable numeric code for the error, recorded alongside the message
    /// in an [`ErrorContext`](../error_context/struct.ErrorContext.html).
    pub fn code(&self) -> i32 {
        match self {
            Error::ConnectionBad(_) => 1,
            Error::PoolExhausted => 2,
            Error::RebindConflict(_) => 3,
            Error::Timeout => 4,
            Error::HandleReleased => 5,
            Error::PoolStopped => 6,
            Error::StopCalledByClone => 7,
            Error::UnresolvedType(_) => 8,
            Error::InvalidConfiguration(_) => 9,
            Error::ConnectFailure(_) => 10,
            Error::Driver(_) => 11,
            Error::IOError(_) => 12,
            Error::TypeOidConflict { .. } => 13,
        }
    }
}
