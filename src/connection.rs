// Copyright 2020 Joyent, Inc.

use std::error;

use crate::oid_map::Oid;

/// Native driver connection
///
/// The `Connection` trait defines the interface a native database driver must
/// implement in order to be wrapped by a
/// [`ConnectionHandle`](../handle/struct.ConnectionHandle.html) and managed by a
/// [`ConnectionPool`](../connection_pool/struct.ConnectionPool.html). A
/// connection need not be limited to a TCP socket, but could be any logical
/// notion of a connection to a database server.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by the driver operations. Each implementation
    /// of the `Connection` trait may choose the appropriate concrete error
    /// type as long as it implements the
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait from
    /// the standard library.
    type Error: error::Error;
    /// The underlying socket or descriptor type exposed through
    /// `ConnectionHandle::get_socket`.
    type Socket;
    /// Attempt to establish the connection to the database. Called once by
    /// the pool when a new handle is created and again on every explicit
    /// reconnect.
    fn connect(&mut self) -> Result<(), Self::Error>;
    /// Close the connection to the database.
    fn close(&mut self) -> Result<(), Self::Error>;
    /// Actively probe the connection. The default implementation assumes the
    /// connection is usable.
    fn is_valid(&mut self) -> bool {
        true
    }
    /// Passively report whether the connection is known to be broken. This
    /// is called with the pool lock held, so it must not perform any I/O
    /// and must return the same answer until the connection state changes.
    fn has_broken(&self) -> bool {
        false
    }
    /// The socket backing an established connection, if any.
    fn socket(&self) -> Option<&Self::Socket>;
    /// Look up the OIDs of the named types in the database type catalog.
    /// Names absent from the catalog are simply omitted from the result.
    fn type_catalog(
        &mut self,
        _names: &[String],
    ) -> Result<Vec<(String, Oid)>, Self::Error> {
        Ok(Vec::new())
    }
}
