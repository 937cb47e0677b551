//! FIFO queue of ready callbacks.
//!
//! Callbacks pushed while the loop drains the queue run on the next
//! iteration, never in the current one.

use crate::error::Result;

use std::cell::RefCell;
use std::collections::VecDeque;

/// A callback scheduled onto the loop. Returning an error stops the loop and
/// surfaces the error from `run_*`.
pub type Callback = Box<dyn FnOnce() -> Result<()>>;

/// Single-threaded FIFO queue of callbacks.
pub(crate) struct ReadyQueue {
    queue: RefCell<VecDeque<Callback>>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Pushes the callback to the back of the queue.
    pub(crate) fn push(&self, callback: Callback) {
        self.queue.borrow_mut().push_back(callback);
    }

    /// Removes the callback at the front of the queue.
    pub(crate) fn pop(&self) -> Option<Callback> {
        self.queue.borrow_mut().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub(crate) fn clear(&self) {
        let callbacks = std::mem::take(&mut *self.queue.borrow_mut());
        drop(callbacks);
    }

    /// Runs exactly the callbacks queued when the call starts.
    ///
    /// The queue is not borrowed while a callback runs, so callbacks may
    /// schedule more work.
    pub(crate) fn run_pending(&self) -> Result<()> {
        let ntodo = self.len();

        for _ in 0..ntodo {
            let Some(callback) = self.pop() else {
                break;
            };
            callback()?;
        }

        Ok(())
    }
}
