// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use timer::Guard;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An I/O execution context
///
/// The context is the scheduling substrate shared by a connection pool and the
/// handles it creates. It owns a timer thread on which delayed and periodic
/// tasks run. Clones refer to the same context; the timer thread exits once
/// the last clone is dropped. Tasks are cancelled by dropping the returned
/// `Guard`.
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<IoContextInner>,
}

struct IoContextInner {
    id: u64,
    name: String,
    timer: Mutex<timer::Timer>,
}

impl IoContext {
    pub fn new<S: Into<String>>(name: S) -> Self {
        IoContext {
            inner: Arc::new(IoContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                timer: Mutex::new(timer::Timer::new()),
            }),
        }
    }

    /// A process-unique identifier for this context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns true if both values refer to the same underlying context.
    pub fn same_context(&self, other: &IoContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `task` every `interval` until the returned guard is dropped.
    pub fn schedule_repeating<F>(&self, interval: Duration, task: F) -> Guard
    where
        F: 'static + FnMut() + Send,
    {
        self.inner
            .timer
            .lock()
            .unwrap()
            .schedule_repeating(chrono_duration(interval), task)
    }

    /// Run `task` once after `delay` unless the returned guard is dropped
    /// first.
    pub fn schedule_with_delay<F>(&self, delay: Duration, task: F) -> Guard
    where
        F: 'static + FnMut() + Send,
    {
        self.inner
            .timer
            .lock()
            .unwrap()
            .schedule_with_delay(chrono_duration(delay), task)
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl PartialEq for IoContext {
    fn eq(&self, other: &IoContext) -> bool {
        self.same_context(other)
    }
}

impl Eq for IoContext {}

// The timer crate works in chrono durations. Anything too large to represent
// is clamped rather than rejected.
fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d)
        .unwrap_or_else(|_| chrono::Duration::max_value())
}
