//! Deadline-ordered timers and the `sleep` helper.
//!
//! Timers live in a min-heap keyed by deadline and insertion order. The loop
//! asks [`Timers::next_deadline`] how long it may block in the backend, then
//! moves every expired timer's callback onto the ready queue with
//! [`Timers::take_expired`]. Cancelled timers stay in the heap until they
//! reach the top, where they are discarded.

use crate::error::Result;
use crate::future::Future;
use crate::runtime::context::CURRENT;
use crate::runtime::handle::LoopHandle;
use crate::runtime::queue::Callback;

use std::cell::{Cell, RefCell};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

struct Timer {
    when: Instant,
    sequence: u64,
    callback: Callback,
    cancelled: Rc<Cell<bool>>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.sequence == other.sequence
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.sequence).cmp(&(other.when, other.sequence))
    }
}

/// Handle returned by `call_later`/`call_at`, used to cancel the timer.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    when: Instant,
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    /// Prevents the callback from running. Cancelling twice is harmless.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn when(&self) -> Instant {
        self.when
    }
}

pub(crate) struct Timers {
    heap: RefCell<BinaryHeap<Reverse<Timer>>>,
    sequence: Cell<u64>,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            heap: RefCell::new(BinaryHeap::new()),
            sequence: Cell::new(0),
        }
    }

    pub(crate) fn register(&self, when: Instant, callback: Callback) -> TimerHandle {
        let sequence = self.sequence.get();
        self.sequence.set(sequence.wrapping_add(1));

        let cancelled = Rc::new(Cell::new(false));
        self.heap.borrow_mut().push(Reverse(Timer {
            when,
            sequence,
            callback,
            cancelled: cancelled.clone(),
        }));

        TimerHandle { when, cancelled }
    }

    /// Drops cancelled timers sitting at the top of the heap.
    fn discard_cancelled(heap: &mut BinaryHeap<Reverse<Timer>>) {
        while let Some(Reverse(top)) = heap.peek() {
            if !top.cancelled.get() {
                break;
            }
            heap.pop();
        }
    }

    /// Deadline of the earliest live timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut heap = self.heap.borrow_mut();
        Self::discard_cancelled(&mut heap);
        heap.peek().map(|Reverse(timer)| timer.when)
    }

    /// Removes every live timer whose deadline is at or before `now`, in
    /// deadline order.
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<Callback> {
        let mut heap = self.heap.borrow_mut();
        let mut expired = Vec::new();

        loop {
            Self::discard_cancelled(&mut heap);
            match heap.peek() {
                Some(Reverse(timer)) if timer.when <= now => {}
                _ => break,
            }
            if let Some(Reverse(timer)) = heap.pop() {
                expired.push(timer.callback);
            }
        }

        expired
    }

    /// Forgets every timer. Callbacks are dropped after the heap is released.
    pub(crate) fn clear(&self) {
        let timers = std::mem::take(&mut *self.heap.borrow_mut());
        drop(timers);
    }
}

/// Returns a Future that resolves once `duration` has elapsed on the given
/// loop.
pub fn sleep_on(handle: &LoopHandle, duration: Duration) -> Future<()> {
    let future = Future::new(handle);
    let waiter = future.clone();

    let timer = handle.call_later(duration, move || -> Result<()> {
        if waiter.done() {
            return Ok(());
        }
        waiter.set_result(())
    });

    // A cancelled sleep must not keep the loop waiting for its deadline.
    future.add_done_callback(move |f| {
        if f.cancelled() {
            timer.cancel();
        }
    });

    future
}

/// Sleeps for the specified duration on the loop running on this thread.
///
/// # Panics
/// Panics if called outside of a running event loop.
///
/// # Example
/// ```ignore
/// use ioloop::sleep;
/// use std::time::Duration;
///
/// async {
///     sleep(Duration::from_millis(100)).await?;
///     Ok::<_, ioloop::Error>(())
/// };
/// ```
pub fn sleep(duration: Duration) -> Future<()> {
    if !CURRENT.is_set() {
        panic!("sleep() called outside of a running event loop");
    }
    CURRENT.with(|handle| sleep_on(handle, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|| Ok(()))
    }

    #[test]
    fn expired_timers_come_out_in_deadline_order() {
        let timers = Timers::new();
        let now = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (label, offset) in [(2, 20), (0, 0), (1, 10)] {
            let order = order.clone();
            timers.register(
                now + Duration::from_millis(offset),
                Box::new(move || {
                    order.borrow_mut().push(label);
                    Ok(())
                }),
            );
        }

        for callback in timers.take_expired(now + Duration::from_millis(15)) {
            callback().unwrap();
        }

        assert_eq!(*order.borrow(), vec![0, 1]);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(20)));
    }

    #[test]
    fn cancelled_timers_are_skipped() {
        let timers = Timers::new();
        let now = Instant::now();

        let first = timers.register(now, noop());
        timers.register(now + Duration::from_secs(5), noop());
        first.cancel();

        assert!(timers.take_expired(now).is_empty());
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
    }
}
