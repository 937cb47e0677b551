//! Backend-agnostic half of the event loop.
//!
//! A [`LoopHandle`] owns the ready queue and the timer set. Futures keep a
//! clone so that settling them can schedule callbacks without knowing which
//! backend drives the loop.

use crate::error::Result;
use crate::runtime::queue::{Callback, ReadyQueue};
use crate::task::Task;
use crate::timer::{TimerHandle, Timers};

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub(crate) struct Shared {
    pub(crate) ready: ReadyQueue,
    pub(crate) timers: Timers,
    pub(crate) stopping: Cell<bool>,
    pub(crate) running: Cell<bool>,
}

/// Cheaply clonable handle to the ready queue and timers of one loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Rc<Shared>,
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("ready", &self.shared.ready.len())
            .field("running", &self.shared.running.get())
            .finish()
    }
}

impl LoopHandle {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(Shared {
                ready: ReadyQueue::new(),
                timers: Timers::new(),
                stopping: Cell::new(false),
                running: Cell::new(false),
            }),
        }
    }

    /// Schedules `callback` to run on the next drain of the ready queue.
    pub fn call_soon<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.shared.ready.push(Box::new(callback));
    }

    pub(crate) fn call_soon_boxed(&self, callback: Callback) {
        self.shared.ready.push(callback);
    }

    /// Schedules `callback` to run once `delay` has elapsed.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.call_at(self.time() + delay, callback)
    }

    /// Schedules `callback` to run at the given instant.
    pub fn call_at<F>(&self, when: Instant, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.shared.timers.register(when, Box::new(callback))
    }

    /// Spawns a computation as a [`Task`] on this loop.
    pub fn spawn<T, F>(&self, computation: F) -> Task<T>
    where
        T: 'static,
        F: std::future::Future<Output = Result<T>> + 'static,
    {
        Task::new(self, computation)
    }

    /// Asks the running loop to return after the current iteration.
    pub fn stop(&self) {
        self.shared.stopping.set(true);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    /// The loop's clock.
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    /// Number of callbacks waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.shared.ready.len()
    }

    /// Runs the callbacks currently queued, without polling any backend.
    ///
    /// Useful when futures are driven by hand, e.g. when exercising a
    /// proactor without a full event loop.
    pub fn run_ready(&self) -> Result<()> {
        self.shared.ready.run_pending()
    }

    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}
