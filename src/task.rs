//! Tasks: suspended computations bound to a [`Future`].
//!
//! A task owns a computation (any `async` block or function returning
//! `Result<T>`) and the Future that will carry its outcome. The loop, never
//! the computation, steps the task:
//!
//! 1. [`Task::new`] schedules the first step on the ready queue
//! 2. A step polls the computation once with a waker bound to the task
//! 3. When the computation awaits a pending [`Future`], the Future records
//!    the waker and the step ends
//! 4. Settling that Future wakes the task, which schedules its next step
//! 5. When the computation returns, the task's Future resolves with the
//!    value, or fails with the returned error
//!
//! # Cancellation
//!
//! A task suspended on a Future records that Future as its waiter.
//! [`Task::cancel`] cancels the waiter, which aborts the operation behind it
//! and wakes the task; the computation then resumes and sees
//! [`Error::Cancelled`] from its `await`. A computation that lets the error
//! propagate leaves its task cancelled.
//!
//! A task with no waiter to cancel (not started yet, or suspended on
//! something other than a Future) only raises a flag. The next step drops
//! the computation instead of resuming it and cancels the task's Future.
//!
//! # Example
//!
//! ```ignore
//! use ioloop::{EventLoop, Task};
//!
//! let event_loop = EventLoop::new()?;
//! let answer = event_loop.run_until_complete(async {
//!     let child = Task::spawn(async { Ok(40) });
//!     Ok(child.await? + 2)
//! })?;
//! assert_eq!(answer, 42);
//! ```

use crate::error::{Error, Result};
use crate::future::{AnyFuture, Future};
use crate::runtime::context::{self, CURRENT, WaiterSlot};
use crate::runtime::handle::LoopHandle;
use crate::runtime::waker::{Schedule, make_waker};

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use log::trace;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

struct TaskInner<T> {
    computation: RefCell<Option<LocalBoxFuture<'static, Result<T>>>>,
    future: Future<T>,
    handle: LoopHandle,
    /// The Future the computation was left waiting on by its last step.
    waiter: WaiterSlot,
    must_cancel: Cell<bool>,
    scheduled: Cell<bool>,
}

/// A spawned computation. Awaiting the task yields its outcome.
pub struct Task<T> {
    inner: Rc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("future", &self.inner.future)
            .field("must_cancel", &self.inner.must_cancel.get())
            .finish()
    }
}

impl<T: 'static> Task<T> {
    /// Wraps `computation` in a task and schedules its first step.
    pub fn new<F>(handle: &LoopHandle, computation: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + 'static,
    {
        let inner = Rc::new(TaskInner {
            computation: RefCell::new(Some(computation.boxed_local())),
            future: Future::new(handle),
            handle: handle.clone(),
            waiter: RefCell::new(None),
            must_cancel: Cell::new(false),
            scheduled: Cell::new(false),
        });

        inner.clone().schedule();

        Self { inner }
    }

    /// Spawns a task on the loop running on this thread.
    ///
    /// # Panics
    /// Panics if called outside of a running event loop.
    pub fn spawn<F>(computation: F) -> Self
    where
        F: std::future::Future<Output = Result<T>> + 'static,
    {
        if !CURRENT.is_set() {
            panic!("Task::spawn() called outside of a running event loop");
        }
        CURRENT.with(|handle| Self::new(handle, computation))
    }

    /// The Future carrying the task's outcome.
    pub fn future(&self) -> &Future<T> {
        &self.inner.future
    }

    pub fn done(&self) -> bool {
        self.inner.future.done()
    }

    /// Requests cancellation. Returns `false` if the task already finished.
    pub fn cancel(&self) -> bool {
        if self.inner.future.done() {
            return false;
        }

        let waiter = self.inner.waiter.borrow_mut().take();
        if !waiter.is_some_and(|waiter| waiter.cancel()) {
            self.inner.must_cancel.set(true);
        }
        self.inner.clone().schedule();
        true
    }
}

impl<T: 'static> TaskInner<T> {
    fn step(self: &Rc<Self>) -> Result<()> {
        self.scheduled.set(false);

        let waiter = self.waiter.borrow_mut().take();

        if self.future.done() {
            // Settled from outside, e.g. its Future was cancelled directly.
            if let Some(waiter) = waiter {
                waiter.cancel();
            }
            drop(self.computation.take());
            return Ok(());
        }

        if self.must_cancel.get() {
            trace!("task cancelled at resumption");
            if let Some(waiter) = waiter {
                waiter.cancel();
            }
            drop(self.computation.take());
            self.future.cancel();
            return Ok(());
        }
        drop(waiter);

        let waker = make_waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let outcome = {
            let mut slot = self.computation.borrow_mut();
            let Some(computation) = slot.as_mut() else {
                return Ok(());
            };
            match context::enter_step(&self.waiter, || computation.poll_unpin(&mut cx)) {
                Poll::Pending => return Ok(()),
                Poll::Ready(outcome) => outcome,
            }
        };
        drop(self.computation.take());

        // The computation may have cancelled its own task while running.
        if self.future.done() {
            return Ok(());
        }

        match outcome {
            Ok(value) => self.future.set_result(value),
            Err(Error::Cancelled) => {
                trace!("task cancelled by its computation");
                self.future.cancel();
                Ok(())
            }
            Err(error) => self.future.set_exception(error),
        }
    }
}

impl<T: 'static> Schedule for TaskInner<T> {
    fn schedule(self: Rc<Self>) {
        if self.scheduled.replace(true) {
            return;
        }
        let handle = self.handle.clone();
        handle.call_soon(move || self.step());
    }
}

impl<T: Clone + 'static> std::future::Future for Task<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut future = self.inner.future.clone();
        let poll = future.poll_unpin(cx);

        // Cancelling an awaiting task cancels this task, not just its Future.
        if poll.is_pending() {
            context::record_waiter(Box::new(Task::clone(&self)));
        }
        poll
    }
}

impl<T: 'static> AnyFuture for Task<T> {
    fn done(&self) -> bool {
        Task::done(self)
    }

    fn cancelled(&self) -> bool {
        self.inner.future.cancelled()
    }

    fn cancel(&self) -> bool {
        Task::cancel(self)
    }

    fn exception(&self) -> Result<Option<Error>> {
        self.inner.future.exception()
    }
}
