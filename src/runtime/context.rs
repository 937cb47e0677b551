//! Thread-local context of the running event loop.
//!
//! While `run_forever` executes, the loop's [`LoopHandle`] is installed in a
//! scoped thread-local so that free functions such as [`spawn`](crate::spawn)
//! and [`sleep`](crate::sleep) can reach it without an explicit handle. The
//! previous context is restored when the scope ends, including on unwind.
//!
//! While a task steps, its waiter slot is installed the same way. A Future
//! that leaves the step pending records itself there, so cancelling the task
//! can cancel the operation it is suspended on.

use crate::future::AnyFuture;
use crate::runtime::handle::LoopHandle;

use std::cell::RefCell;

pub(crate) type WaiterSlot = RefCell<Option<Box<dyn AnyFuture>>>;

scoped_tls::scoped_thread_local!(pub(crate) static CURRENT: LoopHandle);
scoped_tls::scoped_thread_local!(static WAITER: WaiterSlot);

/// Runs `function` with `handle` installed as the current loop.
pub(crate) fn enter_context<F, R>(handle: &LoopHandle, function: F) -> R
where
    F: FnOnce() -> R,
{
    CURRENT.set(handle, function)
}

/// Runs one step of a task with `slot` receiving the Future it ends up
/// waiting on.
pub(crate) fn enter_step<F, R>(slot: &WaiterSlot, function: F) -> R
where
    F: FnOnce() -> R,
{
    WAITER.set(slot, function)
}

/// Records `waiter` as the Future the stepping task is suspended on. Outside
/// a task step this does nothing.
pub(crate) fn record_waiter(waiter: Box<dyn AnyFuture>) {
    if WAITER.is_set() {
        WAITER.with(|slot| {
            let previous = slot.borrow_mut().replace(waiter);
            drop(previous);
        });
    }
}

/// Returns a clone of the handle of the loop running on this thread.
pub fn current() -> Option<LoopHandle> {
    if CURRENT.is_set() {
        Some(CURRENT.with(LoopHandle::clone))
    } else {
        None
    }
}
