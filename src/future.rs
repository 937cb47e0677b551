//! Single-resolution result cells.
//!
//! A [`Future`] starts out pending and moves exactly once to one of three
//! terminal states: resolved with a value, failed with an [`Error`], or
//! cancelled. Terminal states never change again; a second attempt to settle
//! reports [`Error::InvalidState`].
//!
//! Settling a Future never runs consumer code inline. Done-callbacks are
//! pushed onto the owning loop's ready queue, and wakers of tasks awaiting
//! the Future are woken, which only enqueues those tasks.
//!
//! Awaiting a Future clones its value, so any number of tasks may await the
//! same Future. [`Future::take_result`] moves the value out instead; after
//! that, readers get [`Error::InvalidState`].
//!
//! # Example
//!
//! ```ignore
//! use ioloop::{Future, LoopHandle};
//!
//! let handle = LoopHandle::new();
//! let future = Future::new(&handle);
//! future.add_done_callback(|f| println!("done: {:?}", f.result()));
//! future.set_result(42)?;
//! handle.run_ready()?; // prints "done: Ok(42)"
//! ```

use crate::error::{Error, Result};
use crate::runtime::context;
use crate::runtime::handle::LoopHandle;

use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

enum State<T> {
    Pending,
    Cancelled,
    /// `None` once `take_result` moved the value out.
    Resolved(Option<T>),
    Failed(Error),
}

type DoneCallback<T> = Box<dyn FnOnce(&Future<T>)>;
type Canceller = Box<dyn FnOnce()>;

struct Inner<T> {
    state: State<T>,
    callbacks: Vec<DoneCallback<T>>,
    wakers: Vec<Waker>,
    canceller: Option<Canceller>,
}

/// Shared handle to a single-resolution result cell.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
    handle: LoopHandle,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.borrow().state {
            State::Pending => "pending",
            State::Cancelled => "cancelled",
            State::Resolved(_) => "resolved",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<T: 'static> Future<T> {
    /// Creates a pending Future bound to the given loop.
    pub fn new(handle: &LoopHandle) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                callbacks: Vec::new(),
                wakers: Vec::new(),
                canceller: None,
            })),
            handle: handle.clone(),
        }
    }

    /// Creates a pending Future whose cancellation first runs `canceller`.
    ///
    /// The canceller is a best-effort request to abort the underlying
    /// operation; it runs at most once and only while the Future is pending.
    pub fn with_canceller<F>(handle: &LoopHandle, canceller: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        let future = Self::new(handle);
        future.inner.borrow_mut().canceller = Some(Box::new(canceller));
        future
    }

    pub fn done(&self) -> bool {
        !matches!(self.inner.borrow().state, State::Pending)
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Cancelled)
    }

    /// Returns `true` if both handles point to the same cell.
    pub fn ptr_eq(&self, other: &Future<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Resolves the Future with `value`.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.settle(State::Resolved(Some(value)), "result set on a settled future")
    }

    /// Fails the Future with `error`.
    pub fn set_exception(&self, error: Error) -> Result<()> {
        self.settle(State::Failed(error), "exception set on a settled future")
    }

    /// Cancels the Future. Returns `false` if it had already settled.
    ///
    /// The canceller, if any, runs before the transition. Its failure to
    /// abort the underlying operation does not prevent the cancellation.
    pub fn cancel(&self) -> bool {
        let canceller = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return false;
            }
            inner.canceller.take()
        };

        if let Some(canceller) = canceller {
            canceller();
        }

        // The canceller may not settle the Future itself, but check anyway.
        self.settle(State::Cancelled, "future settled while cancelling")
            .is_ok()
    }

    /// Registers `callback` to run on the loop once the Future is done.
    ///
    /// If the Future is already done the callback is scheduled right away.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Pending) {
            inner.callbacks.push(Box::new(callback));
            return;
        }
        drop(inner);

        let this = self.clone();
        self.handle.call_soon(move || {
            callback(&this);
            Ok(())
        });
    }

    /// Returns the error of a failed Future, `None` for a resolved one.
    pub fn exception(&self) -> Result<Option<Error>> {
        match &self.inner.borrow().state {
            State::Pending => Err(Error::InvalidState("exception is not set")),
            State::Cancelled => Err(Error::Cancelled),
            State::Resolved(_) => Ok(None),
            State::Failed(error) => Ok(Some(error.clone())),
        }
    }

    /// Moves the value out of a resolved Future.
    pub fn take_result(&self) -> Result<T> {
        let mut inner = self.inner.borrow_mut();
        match &mut inner.state {
            State::Pending => Err(Error::InvalidState("result is not ready")),
            State::Cancelled => Err(Error::Cancelled),
            State::Resolved(value) => value
                .take()
                .ok_or(Error::InvalidState("result already taken")),
            State::Failed(error) => Err(error.clone()),
        }
    }

    fn settle(&self, state: State<T>, violation: &'static str) -> Result<()> {
        let (callbacks, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return Err(Error::InvalidState(violation));
            }
            inner.state = state;
            inner.canceller = None;
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.wakers),
            )
        };

        for callback in callbacks {
            let this = self.clone();
            self.handle.call_soon(move || {
                callback(&this);
                Ok(())
            });
        }

        for waker in wakers {
            waker.wake();
        }

        Ok(())
    }
}

impl<T: Clone + 'static> Future<T> {
    /// Returns a copy of the value of a resolved Future.
    pub fn result(&self) -> Result<T> {
        match &self.inner.borrow().state {
            State::Pending => Err(Error::InvalidState("result is not ready")),
            State::Cancelled => Err(Error::Cancelled),
            State::Resolved(Some(value)) => Ok(value.clone()),
            State::Resolved(None) => Err(Error::InvalidState("result already taken")),
            State::Failed(error) => Err(error.clone()),
        }
    }
}

/// Every awaiter gets its own copy of the outcome.
impl<T: Clone + 'static> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done() {
            return Poll::Ready(self.result());
        }

        {
            let mut inner = self.inner.borrow_mut();
            if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                inner.wakers.push(cx.waker().clone());
            }
        }
        context::record_waiter(Box::new(Future::clone(&self)));

        Poll::Pending
    }
}

/// Type-erased view of a [`Future`], as returned by a backend's `select`.
pub trait AnyFuture {
    fn done(&self) -> bool;
    fn cancelled(&self) -> bool;
    fn cancel(&self) -> bool;
    fn exception(&self) -> Result<Option<Error>>;
}

impl<T: 'static> AnyFuture for Future<T> {
    fn done(&self) -> bool {
        Future::done(self)
    }

    fn cancelled(&self) -> bool {
        Future::cancelled(self)
    }

    fn cancel(&self) -> bool {
        Future::cancel(self)
    }

    fn exception(&self) -> Result<Option<Error>> {
        Future::exception(self)
    }
}

impl fmt::Debug for dyn AnyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyFuture")
            .field("done", &self.done())
            .field("cancelled", &self.cancelled())
            .finish()
    }
}
