// Copyright 2020 Joyent, Inc.

//! Connection handles and a connection pool for a database client
//!
//! Rack wraps the connections of a native database driver in
//! [`ConnectionHandle`](handle/struct.ConnectionHandle.html)s and manages a
//! set of them in a [`ConnectionPool`](connection_pool/struct.ConnectionPool.html).
//! A driver participates by implementing the
//! [`Connection`](connection/trait.Connection.html) trait.
//!
//! ## Connection handles
//!
//! A handle owns a native driver connection together with everything needed
//! to use it:
//!
//! * the [`IoContext`](io_context/struct.IoContext.html) it is bound to,
//! * a deadline timer for the operations run through it,
//! * the [`OidMap`](oid_map/struct.OidMap.html) used to decode values, which
//!   is resolved against the live connection when the handle is created and
//!   never changes afterwards,
//! * an [`ErrorContext`](error_context/struct.ErrorContext.html) holding the
//!   last error message and code.
//!
//! A handle is either *good* or *bad*. It becomes bad when an operation fails
//! because the connection broke, when an operation exceeds its deadline, or
//! when the caller marks it bad. A bad handle only becomes good again through
//! an explicit `reconnect`. Use `connection_good` and `connection_bad` to
//! inspect a handle and `error_message` to find out what went wrong.
//!
//! ## The connection pool
//!
//! The pool is bound to an I/O context and creates handles lazily, up to
//! `max_connections`. `get_connection` hands out an idle good handle if there
//! is one, establishes a new one if the pool has room, and otherwise waits for
//! a handle to be returned. The number of waiting callers is limited by
//! `queue_capacity`; once that is reached (or if it is zero) the call fails
//! with `PoolExhausted` instead of waiting. Handles are returned to the pool
//! when the `PoolConnection` falls out of scope. Bad handles are never
//! returned to the idle queue: the pool closes them and lazily establishes
//! replacements on demand.
//!
//! Idle handles are closed by a periodic eviction task running on the pool's
//! I/O context once they have been idle for longer than `idle_timeout` or have
//! outlived their `lifespan`.
//!
//! `rebind_io_context` moves the pool, its idle handles and its eviction task
//! to another I/O context. It is only permitted while no handle is checked
//! out. `unwrap_connection` detaches a checked out handle from the pool
//! entirely; the caller may hand it back later with `adopt`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//! use std::thread;
//!
//! use slog::{Drain, Logger, o};
//!
//! use rack::connection_info::ConnectionInfo;
//! use rack::connection_pool::make_connection_pool;
//! use rack::connection_pool::types::ConnectionPoolOptions;
//! use rack::io_context::IoContext;
//! use rack_tcp_stream_connection::TcpStreamConnection;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let io = IoContext::new("main");
//! let info = ConnectionInfo::new("127.0.0.1", 5432).database("moray");
//!
//! let pool_opts = ConnectionPoolOptions {
//!     max_connections: Some(15),
//!     claim_timeout: Some(1000),
//!     log: Some(log),
//!     ..Default::default()
//! };
//!
//! let pool =
//!     make_connection_pool(io, info, pool_opts, TcpStreamConnection::new)?;
//!
//! for _ in 0..10 {
//!     let pool = pool.clone();
//!     thread::spawn(move || {
//!         let conn = pool.get_connection()?;
//!         assert!(conn.connection_good());
//!         // Do stuff here
//!         // The connection is returned to the pool when it falls out of scope.
//!     });
//! }
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_info;
pub mod connection_pool;
pub mod error;
pub mod error_context;
pub mod handle;
pub mod io_context;
pub mod oid_map;
