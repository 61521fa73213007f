// Copyright 2020 Joyent, Inc.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use serde_derive::Deserialize;
use slog::Logger;
use timer::Guard;

use crate::connection::Connection;
use crate::connection_info::ConnectionInfo;
use crate::error::Error;
use crate::error_context::ErrorContext;
use crate::handle::{ConnectionHandle, HandleId};
use crate::io_context::IoContext;
use crate::oid_map::CustomType;

/// A snapshot of the connection counts and lifetime counters of the
/// connection pool. The lifetime counters never decrease.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// The number of handles tracked by the pool: idle, in use and pending
    pub total_connections: ConnectionCount,
    /// The count of idle handles in the pool
    pub idle_connections: ConnectionCount,
    /// The count of handles checked out by callers
    pub in_use_connections: ConnectionCount,
    /// The number of handles being established
    pub pending_connections: ConnectionCount,
    /// The number of callers blocked waiting for a handle
    pub waiting_callers: ConnectionCount,
    /// Handles successfully established
    pub created: EventCount,
    /// Handles handed out to callers
    pub checked_out: EventCount,
    /// Handles given back to the pool by callers
    pub returned: EventCount,
    /// Bad, broken or expired handles closed by the pool
    pub discarded: EventCount,
    /// Idle handles closed by the eviction task
    pub evicted: EventCount,
    /// Handles removed from pool tracking by `unwrap_connection`
    pub detached: EventCount,
    /// Failed attempts to establish a handle and bad handles given back
    pub errors: EventCount,
}

impl ConnectionPoolStats {
    /// Create a new instance of `ConnectionPoolStats`
    pub fn new() -> Self {
        Self::default()
    }
}

/// The configuration options for a connection pool. Every option has a
/// default so an empty TOML document is a valid configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolOptions {
    /// An optional maximum number of handles to maintain in the connection
    /// pool, counting idle, checked out and pending handles. If not specified
    /// the default is 10.
    pub max_connections: Option<u32>,
    /// An optional number of seconds a handle may remain idle before it is
    /// evicted. If not specified the default is 60 seconds.
    pub idle_timeout: Option<u64>,
    /// Optional period in seconds of the idle eviction task. If not specified
    /// the default is 5 seconds.
    pub idle_check_interval: Option<u64>,
    /// An optional maximum age in seconds of a handle. Older handles are
    /// closed instead of being returned to the idle queue. If not specified
    /// the default is 3600 seconds.
    pub lifespan: Option<u64>,
    /// An optional number of callers allowed to block in `get_connection`
    /// when the pool is at capacity. Zero makes `get_connection` fail
    /// immediately with `PoolExhausted`. If not specified the default is 128.
    pub queue_capacity: Option<u32>,
    /// An optional timeout in milliseconds for blocking calls
    /// (`get_connection`) to request a connection from the pool. If not
    /// specified the calls will block indefinitely.
    pub claim_timeout: Option<u64>,
    /// An optional time budget in milliseconds for retrying the initial
    /// connect of a new handle. If not specified the default is 5000
    /// milliseconds.
    pub connect_timeout: Option<u64>,
    /// Custom types to resolve into the OID map of every new handle.
    pub custom_types: Vec<CustomType>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    #[serde(skip)]
    pub log: Option<Logger>,
}

impl ConnectionPoolOptions {
    /// Parse options from a TOML document.
    pub fn from_toml(document: &str) -> Result<Self, Error> {
        toml::from_str(document)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }
}

// Connection pool options with all defaults applied.
#[doc(hidden)]
#[derive(Copy, Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub lifespan: Duration,
    pub queue_capacity: u32,
    pub claim_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A newtype wrapper around u64 used for the lifetime event counters of the
/// connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
)]
pub struct EventCount(u64);

impl EventCount {
    pub fn incr(&mut self) {
        self.0 += 1;
    }
}

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
pub struct ConnectionData<C>
where
    C: Connection,
{
    pub info: ConnectionInfo,
    pub io_context: IoContext,
    pub idle: VecDeque<ConnectionHandle<C>>,
    pub in_use: HashSet<HandleId>,
    pub stats: ConnectionPoolStats,
    pub state: ConnectionPoolState,
    pub last_error: ErrorContext,
    pub eviction_guard: Option<Guard>,
}

impl<C> ConnectionData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new(
        info: ConnectionInfo,
        io_context: IoContext,
        max_size: usize,
    ) -> Self {
        ConnectionData {
            info,
            io_context,
            idle: VecDeque::with_capacity(max_size),
            in_use: HashSet::with_capacity(max_size),
            stats: ConnectionPoolStats::new(),
            state: ConnectionPoolState::Running,
            last_error: ErrorContext::default(),
            eviction_guard: None,
        }
    }

    // Handles that count against `max_connections`.
    pub fn live_connections(&self) -> u32 {
        self.stats.total_connections.into()
    }

    pub fn sync_gauges(&mut self) {
        let idle = self.idle.len() as u32;
        let in_use = self.in_use.len() as u32;
        self.stats.idle_connections = idle.into();
        self.stats.in_use_connections = in_use.into();
        self.stats.total_connections =
            ConnectionCount::from(idle + in_use) + self.stats.pending_connections;
    }
}

// Protected access to the internal connection pool data structures
#[doc(hidden)]
pub struct ProtectedData<C>(Arc<(Mutex<ConnectionData<C>>, Condvar)>)
where
    C: Connection;

impl<C> ProtectedData<C>
where
    C: Connection,
{
    pub fn new(connection_data: ConnectionData<C>) -> Self {
        ProtectedData(Arc::new((Mutex::new(connection_data), Condvar::new())))
    }

    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<C>> {
        (self.0).0.lock().unwrap()
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C>>,
        m_timeout: Option<Duration>,
    ) -> (MutexGuard<'a, ConnectionData<C>>, bool) {
        match m_timeout {
            Some(timeout) => {
                let wait_result = (self.0).1.wait_timeout(g, timeout).unwrap();
                (wait_result.0, wait_result.1.timed_out())
            }
            None => ((self.0).1.wait(g).unwrap(), false),
        }
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one()
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all()
    }

    pub fn downgrade(&self) -> WeakProtectedData<C> {
        WeakProtectedData(Arc::downgrade(&self.0))
    }
}

impl<C> Clone for ProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedData<C> {
        ProtectedData(Arc::clone(&self.0))
    }
}

impl<C> fmt::Debug for ProtectedData<C>
where
    C: Connection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ProtectedData").finish()
    }
}

// A reference to the pool data held by timer tasks. Timer tasks live on the
// I/O context, which the pool data itself refers to, so a strong reference
// would keep both alive forever.
#[doc(hidden)]
pub struct WeakProtectedData<C>(Weak<(Mutex<ConnectionData<C>>, Condvar)>)
where
    C: Connection;

impl<C> WeakProtectedData<C>
where
    C: Connection,
{
    pub fn upgrade(&self) -> Option<ProtectedData<C>> {
        self.0.upgrade().map(ProtectedData)
    }
}

impl<C> Clone for WeakProtectedData<C>
where
    C: Connection,
{
    fn clone(&self) -> WeakProtectedData<C> {
        WeakProtectedData(Weak::clone(&self.0))
    }
}

/// Sum type representing the current state of the connection pool. Possible
/// states are running, stopping, or stopped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionPoolState {
    /// The pool is running and able to service connection requests.
    Running,
    /// The connection pool is performing cleanup and is no longer accepting
    /// connection requests.
    Stopping,
    /// The connection pool is stopped and is no longer accepting connection
    /// requests.
    Stopped,
}

impl fmt::Display for ConnectionPoolState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionPoolState::Running => String::from("running").fmt(fmt),
            ConnectionPoolState::Stopping => String::from("stopping").fmt(fmt),
            ConnectionPoolState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}
