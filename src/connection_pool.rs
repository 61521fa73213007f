// Copyright 2020 Joyent, Inc.

pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::connection::Connection;
use crate::connection_info::{connection_key, ConnectionInfo};
use crate::connection_pool::types::{
    ConnectionData, ConnectionPoolOptions, ConnectionPoolState,
    ConnectionPoolStats, PoolSettings, ProtectedData, WeakProtectedData,
};
use crate::error::Error;
use crate::error_context::ErrorContext;
use crate::handle::{ConnectionHandle, HandleId};
use crate::io_context::IoContext;
use crate::oid_map::OidMapBuilder;

// Default number of maximum pool connections
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
// Idle timeout in seconds
const DEFAULT_IDLE_TIMEOUT: u64 = 60;
// Idle eviction interval in seconds
const DEFAULT_IDLE_CHECK_INTERVAL: u64 = 5;
// Maximum handle age in seconds
const DEFAULT_LIFESPAN: u64 = 3600;
// Number of callers allowed to wait for a connection
const DEFAULT_QUEUE_CAPACITY: u32 = 128;
// Connect retry budget in milliseconds
const DEFAULT_CONNECT_TIMEOUT: u64 = 5000;

/// Construct a connection pool bound to `io_context`. This is the same as
/// [`ConnectionPool::new`](struct.ConnectionPool.html#method.new).
pub fn make_connection_pool<C, F>(
    io_context: IoContext,
    info: ConnectionInfo,
    cpo: ConnectionPoolOptions,
    create_connection: F,
) -> Result<ConnectionPool<C, F>, Error>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    ConnectionPool::new(io_context, info, cpo, create_connection)
}

/// A pool of connection handles to a database
///
/// Clones of a pool share the same handles, statistics and lock. Only the
/// original instance may stop the pool and dropping the original stops it.
pub struct ConnectionPool<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    protected_data: ProtectedData<C>,
    create_connection: Arc<Mutex<F>>,
    oid_map: OidMapBuilder,
    settings: PoolSettings,
    log: Logger,
    original: bool,
    _connection: PhantomData<C>,
}

impl<C, F> Debug for ConnectionPool<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("protected_data", &self.protected_data)
            .field("oid_map", &self.oid_map)
            .field("settings", &self.settings)
            .field("log", &self.log)
            .field("original", &self.original)
            .finish()
    }
}

impl<C, F> Clone for ConnectionPool<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    fn clone(&self) -> ConnectionPool<C, F> {
        ConnectionPool {
            protected_data: self.protected_data.clone(),
            create_connection: self.create_connection.clone(),
            oid_map: self.oid_map.clone(),
            settings: self.settings,
            log: self.log.clone(),
            original: false,
            _connection: PhantomData,
        }
    }
}

impl<C, F> ConnectionPool<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    /// Create a new connection pool. No handles are created up front; they
    /// are established on demand by `get_connection`. The idle eviction task
    /// is scheduled on `io_context`.
    pub fn new(
        io_context: IoContext,
        info: ConnectionInfo,
        cpo: ConnectionPoolOptions,
        create_connection: F,
    ) -> Result<Self, Error> {
        let max_connections =
            cpo.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(Error::InvalidConfiguration(String::from(
                "max_connections must be greater than zero",
            )));
        }

        let idle_check_interval = cpo
            .idle_check_interval
            .unwrap_or(DEFAULT_IDLE_CHECK_INTERVAL);
        if idle_check_interval == 0 {
            return Err(Error::InvalidConfiguration(String::from(
                "idle_check_interval must be greater than zero",
            )));
        }

        let settings = PoolSettings {
            max_connections,
            idle_timeout: Duration::from_secs(
                cpo.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            ),
            idle_check_interval: Duration::from_secs(idle_check_interval),
            lifespan: Duration::from_secs(
                cpo.lifespan.unwrap_or(DEFAULT_LIFESPAN),
            ),
            queue_capacity: cpo
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            claim_timeout: cpo.claim_timeout.map(Duration::from_millis),
            connect_timeout: Duration::from_millis(
                cpo.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ),
        };

        let key = connection_key(&info);
        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => key.to_string()));

        let oid_map = OidMapBuilder::from_custom_types(&cpo.custom_types);

        let connection_data = ConnectionData::new(
            info,
            io_context.clone(),
            max_connections as usize,
        );
        let protected_data = ProtectedData::new(connection_data);

        let eviction_guard = start_idle_eviction(
            &io_context,
            settings,
            protected_data.downgrade(),
            logger.clone(),
        );
        protected_data.connection_data_lock().eviction_guard =
            Some(eviction_guard);

        info!(
            logger,
            "connection pool created";
            "max_connections" => max_connections,
            "io_context" => io_context.name()
        );

        Ok(ConnectionPool {
            protected_data,
            create_connection: Arc::new(Mutex::new(create_connection)),
            oid_map,
            settings,
            log: logger,
            original: true,
            _connection: PhantomData,
        })
    }

    /// Stop the connection pool and close all idle connections. This
    /// function may only be called on the original ConnectionPool instance;
    /// invocation by a clone of the pool results in an error. Connections
    /// still checked out are closed when they are returned.
    pub fn stop(&mut self) -> Result<(), Error> {
        if !self.original {
            trace!(self.log, "stop called by pool clone");
            return Err(Error::StopCalledByClone);
        }

        let mut connection_data = self.protected_data.connection_data_lock();
        if connection_data.state == ConnectionPoolState::Stopped {
            return Ok(());
        }
        trace!(self.log, "stop called by original pool");

        connection_data.state = ConnectionPoolState::Stopping;
        let _guard = connection_data.eviction_guard.take();

        info!(
            self.log,
            "connections queue size: {}",
            connection_data.idle.len()
        );

        while let Some(handle) = connection_data.idle.pop_front() {
            close_handle(self.log.clone(), handle);
        }
        connection_data.sync_gauges();

        connection_data.state = ConnectionPoolState::Stopped;
        drop(connection_data);

        // Wake every waiter so they observe the new state
        self.protected_data.condvar_notify_all();
        Ok(())
    }

    /// Check out a connection handle.
    ///
    /// An idle handle is reused if one is available and still good; idle
    /// handles found bad, broken or past their lifespan are closed along the
    /// way. Otherwise a new handle is established if the pool is below its
    /// maximum size. At capacity the caller waits for a handle to be
    /// returned, unless the wait queue is full (or has zero capacity), in
    /// which case `PoolExhausted` is returned. A wait that exceeds the claim
    /// timeout fails with `Timeout`.
    pub fn get_connection(&self) -> Result<PoolConnection<C, F>, Error> {
        let deadline = self.settings.claim_timeout.map(|t| Instant::now() + t);
        let mut connection_data = self.protected_data.connection_data_lock();

        loop {
            if connection_data.state != ConnectionPoolState::Running {
                return Err(Error::PoolStopped);
            }

            if let Some(handle) = self.pop_idle(&mut connection_data) {
                return Ok(self.check_out(&mut connection_data, handle));
            }

            if connection_data.live_connections()
                < self.settings.max_connections
            {
                return self.create_handle(connection_data);
            }

            let waiting: u32 = connection_data.stats.waiting_callers.into();
            if waiting >= self.settings.queue_capacity {
                debug!(self.log, "connection pool exhausted");
                let err = Error::PoolExhausted;
                connection_data.last_error = ErrorContext::from(&err);
                return Err(err);
            }

            let m_timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(self.claim_timed_out(&mut connection_data));
                    }
                    Some(d - now)
                }
                None => None,
            };

            connection_data.stats.waiting_callers += 1.into();
            let (guard, timed_out) = self
                .protected_data
                .condvar_wait(connection_data, m_timeout);
            connection_data = guard;
            connection_data.stats.waiting_callers -= 1.into();

            if timed_out {
                return Err(self.claim_timed_out(&mut connection_data));
            }
        }
    }

    /// Check out an idle connection handle without blocking and without
    /// establishing a new one.
    pub fn try_get_connection(&self) -> Option<PoolConnection<C, F>> {
        let mut connection_data = self.protected_data.connection_data_lock();
        if connection_data.state != ConnectionPoolState::Running {
            return None;
        }
        let m_handle = self.pop_idle(&mut connection_data);
        m_handle.map(|handle| self.check_out(&mut connection_data, handle))
    }

    /// Return a snapshot of the pool statistics.
    pub fn get_statistics(&self) -> ConnectionPoolStats {
        self.protected_data.connection_data_lock().stats
    }

    pub fn get_state(&self) -> String {
        self.protected_data.connection_data_lock().state.to_string()
    }

    /// The I/O context new handles are bound to.
    pub fn get_io_context(&self) -> IoContext {
        self.protected_data.connection_data_lock().io_context.clone()
    }

    /// The last error recorded by the pool itself.
    pub fn get_error_context(&self) -> ErrorContext {
        self.protected_data.connection_data_lock().last_error.clone()
    }

    pub fn error_message(&self) -> String {
        self.get_error_context().message().to_string()
    }

    /// Bind the pool and every idle handle to a different I/O context and
    /// move the idle eviction task there. The swap happens while holding the
    /// pool lock, so no handle can be checked out while it is in progress.
    /// Fails with `RebindConflict` if any handle is checked out or being
    /// established.
    pub fn rebind_io_context(&self, io_context: IoContext) -> Result<(), Error> {
        let mut connection_data = self.protected_data.connection_data_lock();

        let busy = connection_data.in_use.len() as u32
            + u32::from(connection_data.stats.pending_connections);
        if busy > 0 {
            warn!(
                self.log,
                "refusing to rebind I/O context with {} connections \
                 checked out",
                busy
            );
            let err = Error::RebindConflict(busy);
            connection_data.last_error = ErrorContext::from(&err);
            return Err(err);
        }

        connection_data.idle.iter_mut().for_each(|handle| {
            handle.rebind_io_context(io_context.clone());
        });

        // Cancel the old eviction task before scheduling the new one
        let _old_guard = connection_data.eviction_guard.take();
        if connection_data.state == ConnectionPoolState::Running {
            connection_data.eviction_guard = Some(start_idle_eviction(
                &io_context,
                self.settings,
                self.protected_data.downgrade(),
                self.log.clone(),
            ));
        }

        let previous =
            std::mem::replace(&mut connection_data.io_context, io_context);
        info!(
            self.log,
            "rebound I/O context";
            "from" => previous.name(),
            "to" => connection_data.io_context.name()
        );
        Ok(())
    }

    /// Remove a checked out handle from the tracking of the pool it was
    /// checked out of and hand it to the caller. That pool no longer counts
    /// the handle against its maximum. The caller may give it back with
    /// [`adopt`](#method.adopt); dropping the handle closes the native
    /// connection.
    pub fn unwrap_connection(
        &self,
        mut connection: PoolConnection<C, F>,
    ) -> Result<ConnectionHandle<C>, Error> {
        let handle = connection.handle.take().ok_or(Error::HandleReleased)?;
        let owner = &connection.connection_pool;

        let mut connection_data = owner.protected_data.connection_data_lock();
        connection_data.in_use.remove(&handle.id());
        connection_data.stats.detached.incr();
        connection_data.sync_gauges();
        drop(connection_data);

        debug!(owner.log, "detached connection handle {}", handle.id());
        // A slot opened up for a waiting caller
        owner.protected_data.condvar_notify();
        Ok(handle)
    }

    /// Give a detached handle back to the pool. The handle is probed first
    /// and joins the idle queue if it is good, young enough and the pool has
    /// room for it; otherwise it is closed.
    pub fn adopt(&self, mut handle: ConnectionHandle<C>) {
        let valid = handle.validate();
        let mut connection_data = self.protected_data.connection_data_lock();

        let has_room =
            connection_data.live_connections() < self.settings.max_connections;
        if connection_data.state == ConnectionPoolState::Running
            && has_room
            && valid
            && handle.age() < self.settings.lifespan
        {
            debug!(self.log, "adopted connection handle {}", handle.id());
            handle.mark_idle();
            connection_data.idle.push_back(handle);
            connection_data.sync_gauges();
            drop(connection_data);
            self.protected_data.condvar_notify();
        } else {
            drop(connection_data);
            close_handle(self.log.clone(), handle);
        }
    }

    // Take the first usable idle handle, closing unusable ones.
    fn pop_idle(
        &self,
        connection_data: &mut MutexGuard<ConnectionData<C>>,
    ) -> Option<ConnectionHandle<C>> {
        while let Some(handle) = connection_data.idle.pop_front() {
            if handle.connection_bad() {
                warn!(
                    self.log,
                    "Found an invalid idle connection {}, discarding",
                    handle.id()
                );
                connection_data.stats.discarded.incr();
                close_handle(self.log.clone(), handle);
            } else if handle.age() >= self.settings.lifespan {
                debug!(self.log, "connection {} outlived its lifespan", handle.id());
                connection_data.stats.discarded.incr();
                close_handle(self.log.clone(), handle);
            } else {
                info!(self.log, "Found idle connection {}", handle.id());
                connection_data.sync_gauges();
                return Some(handle);
            }
        }
        connection_data.sync_gauges();
        None
    }

    fn check_out(
        &self,
        connection_data: &mut MutexGuard<ConnectionData<C>>,
        mut handle: ConnectionHandle<C>,
    ) -> PoolConnection<C, F> {
        handle.reset_error_context();
        connection_data.in_use.insert(handle.id());
        connection_data.stats.checked_out.incr();
        connection_data.sync_gauges();
        PoolConnection {
            connection_pool: self.clone(),
            handle: Some(handle),
        }
    }

    // Reserve a slot under the lock, then establish the handle without
    // holding it so other callers are not blocked behind the driver.
    fn create_handle(
        &self,
        mut connection_data: MutexGuard<ConnectionData<C>>,
    ) -> Result<PoolConnection<C, F>, Error> {
        connection_data.stats.pending_connections += 1.into();
        connection_data.sync_gauges();
        let info = connection_data.info.clone();
        let io_context = connection_data.io_context.clone();
        drop(connection_data);

        debug!(self.log, "establishing new connection to {}", info.name());
        let native = {
            let mut create_connection = self.create_connection.lock().unwrap();
            (&mut *create_connection)(&info)
        };
        let result = ConnectionHandle::establish(
            native,
            io_context,
            self.oid_map.clone(),
            self.settings.connect_timeout,
            &self.log,
        );

        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.stats.pending_connections -= 1.into();
        match result {
            Ok(handle) => {
                connection_data.stats.created.incr();
                if connection_data.state != ConnectionPoolState::Running {
                    connection_data.sync_gauges();
                    drop(connection_data);
                    close_handle(self.log.clone(), handle);
                    return Err(Error::PoolStopped);
                }
                info!(self.log, "Added connection {}", handle.id());
                Ok(self.check_out(&mut connection_data, handle))
            }
            Err(err) => {
                error!(self.log, "Giving up trying to establish connection: {}", err);
                connection_data.stats.errors.incr();
                connection_data.last_error = ErrorContext::from(&err);
                connection_data.sync_gauges();
                drop(connection_data);
                // The reserved slot is free again
                self.protected_data.condvar_notify();
                Err(err)
            }
        }
    }

    fn claim_timed_out(
        &self,
        connection_data: &mut MutexGuard<ConnectionData<C>>,
    ) -> Error {
        debug!(self.log, "timed out waiting for a connection");
        let err = Error::Timeout;
        connection_data.last_error = ErrorContext::from(&err);
        err
    }

    fn replace(&self, mut handle: ConnectionHandle<C>) {
        let mut connection_data = self.protected_data.connection_data_lock();
        connection_data.in_use.remove(&handle.id());
        connection_data.stats.returned.incr();

        if connection_data.state != ConnectionPoolState::Running {
            connection_data.sync_gauges();
            drop(connection_data);
            close_handle(self.log.clone(), handle);
            return;
        }

        if handle.connection_bad() {
            warn!(
                self.log,
                "Found an invalid connection {}, not returning to the pool",
                handle.id();
                "error" => handle.error_message().to_string()
            );
            connection_data.stats.errors.incr();
            connection_data.stats.discarded.incr();
            close_handle(self.log.clone(), handle);
        } else if handle.age() >= self.settings.lifespan {
            debug!(self.log, "connection {} outlived its lifespan", handle.id());
            connection_data.stats.discarded.incr();
            close_handle(self.log.clone(), handle);
        } else {
            handle.mark_idle();
            connection_data.idle.push_back(handle);
        }
        connection_data.sync_gauges();
        drop(connection_data);
        self.protected_data.condvar_notify();
    }
}

impl<C, F> Drop for ConnectionPool<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    fn drop(&mut self) {
        // Stop the pool and ignore the result. The returned Result will be an
        // Err if the pool instance going out of scope is a clone,
        // but there is not further error handling to be done here.
        let _ = self.stop();
    }
}

/// A connection handle checked out of the pool. The handle is returned to
/// the pool when this value falls out of scope.
pub struct PoolConnection<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    connection_pool: ConnectionPool<C, F>,
    handle: Option<ConnectionHandle<C>>,
}

impl<C, F> PoolConnection<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    pub fn id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(ConnectionHandle::id)
    }
}

impl<C, F> Debug for PoolConnection<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("PoolConnection")
            .field("handle", &self.handle)
            .finish()
    }
}

impl<C, F> Drop for PoolConnection<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.connection_pool.replace(handle);
        }
    }
}

impl<C, F> Deref for PoolConnection<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    type Target = ConnectionHandle<C>;

    // The handle is only taken by `unwrap_connection`, which consumes the
    // PoolConnection, and by drop.
    fn deref(&self) -> &ConnectionHandle<C> {
        self.handle.as_ref().unwrap()
    }
}

impl<C, F> DerefMut for PoolConnection<C, F>
where
    C: Connection,
    F: FnMut(&ConnectionInfo) -> C + Send + 'static,
{
    fn deref_mut(&mut self) -> &mut ConnectionHandle<C> {
        self.handle.as_mut().unwrap()
    }
}

// Driver close functions are outside the control of the pool, so run them on
// their own thread rather than under the pool lock.
fn close_handle<C>(log: Logger, mut handle: ConnectionHandle<C>)
where
    C: Connection,
{
    let _close_thread = thread::spawn(move || {
        let id = handle.id();
        info!(log, "Closing connection {}", id);
        if let Err(err) = handle.close_connection() {
            if let Error::HandleReleased = err {
                return;
            }
            warn!(
                log,
                "Failed to properly close connection {}. Reason: {}", id, err
            );
        }
    });
}

/// Schedule the periodic idle eviction task on the given I/O context
fn start_idle_eviction<C>(
    io_context: &IoContext,
    settings: PoolSettings,
    protected_data: WeakProtectedData<C>,
    log: Logger,
) -> Guard
where
    C: Connection,
{
    debug!(
        log,
        "starting idle eviction task, interval {:?}",
        settings.idle_check_interval;
        "io_context" => io_context.name()
    );
    io_context.schedule_repeating(settings.idle_check_interval, move || {
        if let Some(protected_data) = protected_data.upgrade() {
            evict_idle_connections(&protected_data, settings, &log)
        }
    })
}

fn evict_idle_connections<C>(
    protected_data: &ProtectedData<C>,
    settings: PoolSettings,
    log: &Logger,
) where
    C: Connection,
{
    let mut connection_data = protected_data.connection_data_lock();
    if connection_data.state != ConnectionPoolState::Running {
        return;
    }

    let len = connection_data.idle.len();
    if len == 0 {
        return;
    }
    trace!(log, "Performing idle check on {} connections", len);

    let mut kept = Vec::with_capacity(len);
    let mut evicted = 0;
    let mut discarded = 0;
    while let Some(handle) = connection_data.idle.pop_front() {
        if handle.connection_bad() || handle.age() >= settings.lifespan {
            discarded += 1;
            close_handle(log.clone(), handle);
        } else if handle.idle_for() >= settings.idle_timeout {
            evicted += 1;
            close_handle(log.clone(), handle);
        } else {
            kept.push(handle);
        }
    }
    connection_data.idle.extend(kept);

    for _ in 0..evicted {
        connection_data.stats.evicted.incr();
    }
    for _ in 0..discarded {
        connection_data.stats.discarded.incr();
    }
    connection_data.sync_gauges();

    if evicted + discarded > 0 {
        debug!(
            log,
            "Evicted {} idle and {} unusable connections", evicted, discarded;
            "idle_connections" => u32::from(connection_data.stats.idle_connections),
            "total_connections" => u32::from(connection_data.stats.total_connections)
        );
        drop(connection_data);
        protected_data.condvar_notify_all();
    }
}
