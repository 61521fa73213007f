// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::{ExponentialBackoff, Operation};
use derive_more::{Display, From, Into};
use slog::{debug, warn, Logger};

use crate::connection::Connection;
use crate::error::Error;
use crate::error_context::ErrorContext;
use crate::io_context::IoContext;
use crate::oid_map::{OidMap, OidMapBuilder};

// First delay between connection attempts
const CONNECT_RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(50);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique identifier for a connection handle.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The health of a connection handle. A handle moves from `Good` to `Bad` on
/// an I/O failure or timeout and only moves back through an explicit
/// reconnect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleState {
    Good,
    Bad,
}

impl fmt::Display for HandleState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandleState::Good => String::from("good").fmt(fmt),
            HandleState::Bad => String::from("bad").fmt(fmt),
        }
    }
}

/// Deadline state for operations on a connection handle.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionTimer {
    deadline: Option<Instant>,
}

impl ConnectionTimer {
    pub fn expires_after(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn expires_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Time left before the deadline, or `None` when no deadline is armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// A single logical connection to the database
///
/// A `ConnectionHandle` owns a native driver connection together with the I/O
/// context it is bound to, a deadline timer, the OID map resolved for the
/// connection and the last error recorded against it. Handles are not shared:
/// a handle is either held by a connection pool or by the one caller that
/// checked it out, so none of its operations take a lock.
pub struct ConnectionHandle<C>
where
    C: Connection,
{
    id: HandleId,
    native: Option<C>,
    io_context: IoContext,
    timer: ConnectionTimer,
    oid_map: Arc<OidMap>,
    error_context: ErrorContext,
    state: HandleState,
    created_at: Instant,
    idle_since: Instant,
}

impl<C> ConnectionHandle<C>
where
    C: Connection,
{
    /// Connect `native`, retrying with exponential backoff for up to
    /// `connect_timeout`, then resolve the OID map against the live
    /// connection.
    pub fn establish(
        mut native: C,
        io_context: IoContext,
        oid_map: OidMapBuilder,
        connect_timeout: Duration,
        log: &Logger,
    ) -> Result<Self, Error> {
        connect_with_backoff(&mut native, connect_timeout, log)?;

        let oid_map = match oid_map.populate(&mut native) {
            Ok(oid_map) => oid_map,
            Err(err) => {
                warn!(log, "Failed to build oid map: {}", err);
                let _ = native.close();
                return Err(err);
            }
        };

        let now = Instant::now();
        let handle = ConnectionHandle {
            id: HandleId::next(),
            native: Some(native),
            io_context,
            timer: ConnectionTimer::default(),
            oid_map,
            error_context: ErrorContext::default(),
            state: HandleState::Good,
            created_at: now,
            idle_since: now,
        };
        debug!(log, "Established connection handle {}", handle.id);
        Ok(handle)
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn connection_good(&self) -> bool {
        match &self.native {
            Some(native) => {
                self.state == HandleState::Good && !native.has_broken()
            }
            None => false,
        }
    }

    pub fn connection_bad(&self) -> bool {
        !self.connection_good()
    }

    pub fn get_native_handle(&self) -> Result<&C, Error> {
        self.native.as_ref().ok_or(Error::HandleReleased)
    }

    pub fn get_native_handle_mut(&mut self) -> Result<&mut C, Error> {
        self.native.as_mut().ok_or(Error::HandleReleased)
    }

    /// The socket of the native connection. A handle without a socket is
    /// treated as released.
    pub fn get_socket(&self) -> Result<&C::Socket, Error> {
        self.get_native_handle()?
            .socket()
            .ok_or(Error::HandleReleased)
    }

    pub fn get_io_context(&self) -> Result<&IoContext, Error> {
        self.get_native_handle()?;
        Ok(&self.io_context)
    }

    pub fn get_timer(&self) -> Result<&ConnectionTimer, Error> {
        self.get_native_handle()?;
        Ok(&self.timer)
    }

    pub fn get_timer_mut(&mut self) -> Result<&mut ConnectionTimer, Error> {
        self.get_native_handle()?;
        Ok(&mut self.timer)
    }

    pub fn get_oid_map(&self) -> Result<&Arc<OidMap>, Error> {
        self.get_native_handle()?;
        Ok(&self.oid_map)
    }

    pub fn get_error_context(&self) -> &ErrorContext {
        &self.error_context
    }

    /// The message of the last recorded error, or an empty string.
    pub fn error_message(&self) -> &str {
        self.error_context.message()
    }

    pub fn set_error_context<S: Into<String>>(&mut self, message: S, code: i32) {
        self.error_context.set(message, code);
    }

    pub fn reset_error_context(&mut self) {
        self.error_context.reset();
    }

    /// Move the handle to the `Bad` state, recording `reason` as its error
    /// context.
    pub fn mark_bad<S: Into<String>>(&mut self, reason: S) {
        let reason = reason.into();
        let code = Error::ConnectionBad(reason.clone()).code();
        self.error_context.set(reason, code);
        self.state = HandleState::Bad;
    }

    /// Actively probe the native connection with `Connection::is_valid`. A
    /// failed probe marks the handle bad.
    pub fn validate(&mut self) -> bool {
        let valid = match self.native.as_mut() {
            Some(native) => native.is_valid(),
            None => return false,
        };
        if !valid && self.state == HandleState::Good {
            self.mark_bad("connection failed validation");
        }
        self.connection_good()
    }

    /// Run a driver operation on the native connection.
    ///
    /// The operation is refused if the handle is released, bad, or its timer
    /// has already expired. A driver error is recorded in the error context;
    /// the handle only becomes bad if the driver then reports the connection
    /// as broken. An operation that finishes after the timer deadline is
    /// reported as a timeout and leaves the handle bad.
    pub fn execute<T, O>(&mut self, op: O) -> Result<T, Error>
    where
        O: FnOnce(&mut C) -> Result<T, C::Error>,
    {
        if self.native.is_none() {
            return Err(Error::HandleReleased);
        }
        if self.state == HandleState::Bad {
            return Err(Error::ConnectionBad(self.error_message().to_string()));
        }
        if self.timer.expired() {
            return Err(self.fail(Error::Timeout));
        }

        let native = self.native.as_mut().ok_or(Error::HandleReleased)?;
        let result = op(native);
        let broken = native.has_broken();

        match result {
            Ok(value) => {
                if self.timer.expired() {
                    Err(self.fail(Error::Timeout))
                } else {
                    Ok(value)
                }
            }
            Err(e) => {
                let err = Error::Driver(e.to_string());
                self.error_context = ErrorContext::from(&err);
                if broken {
                    self.state = HandleState::Bad;
                }
                Err(err)
            }
        }
    }

    /// Close and reopen the native connection. On success the handle returns
    /// to the `Good` state with a clear error context and no armed deadline.
    pub fn reconnect(&mut self) -> Result<(), Error> {
        let native = self.native.as_mut().ok_or(Error::HandleReleased)?;
        let _ = native.close();
        match native.connect() {
            Ok(()) => {
                self.state = HandleState::Good;
                self.error_context.reset();
                self.timer.cancel();
                Ok(())
            }
            Err(e) => Err(self.fail(Error::ConnectFailure(e.to_string()))),
        }
    }

    /// Bind the handle to a different I/O context.
    pub fn rebind_io_context(&mut self, io_context: IoContext) -> IoContext {
        std::mem::replace(&mut self.io_context, io_context)
    }

    /// Close the native connection and release it from the handle. All
    /// accessors fail with `HandleReleased` afterwards.
    pub fn close_connection(&mut self) -> Result<(), Error> {
        let mut native = self.native.take().ok_or(Error::HandleReleased)?;
        self.state = HandleState::Bad;
        native.close().map_err(|e| Error::Driver(e.to_string()))
    }

    /// Consume the handle and give up the native connection.
    pub fn into_native(mut self) -> Result<C, Error> {
        self.native.take().ok_or(Error::HandleReleased)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    fn fail(&mut self, err: Error) -> Error {
        self.error_context = ErrorContext::from(&err);
        self.state = HandleState::Bad;
        err
    }
}

// A handle still holding its native connection closes it on the way out.
impl<C> Drop for ConnectionHandle<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        if let Some(mut native) = self.native.take() {
            let _ = native.close();
        }
    }
}

impl<C> fmt::Debug for ConnectionHandle<C>
where
    C: Connection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("released", &self.native.is_none())
            .field("io_context", &self.io_context)
            .field("timer", &self.timer)
            .field("error_context", &self.error_context)
            .finish()
    }
}

fn connect_with_backoff<C>(
    conn: &mut C,
    connect_timeout: Duration,
    log: &Logger,
) -> Result<(), Error>
where
    C: Connection,
{
    let mut backoff = ExponentialBackoff::default();
    backoff.initial_interval = CONNECT_RETRY_INITIAL_INTERVAL;
    backoff.current_interval = CONNECT_RETRY_INITIAL_INTERVAL;
    backoff.max_elapsed_time = Some(connect_timeout);

    let mut op = || -> Result<(), backoff::Error<String>> {
        debug!(log, "attempting to connect with retry...");
        conn.connect().map_err(|e| {
            warn!(log, "Retrying connection: {}", e);
            e.to_string()
        })?;
        Ok(())
    };

    op.retry(&mut backoff).map_err(|e| match e {
        backoff::Error::Permanent(msg) | backoff::Error::Transient(msg) => {
            Error::ConnectFailure(msg)
        }
    })
}
