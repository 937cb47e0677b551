//! Waker implementation for task wake-up notifications.
//!
//! Waking a task never polls it: the waker only asks the task to schedule
//! its next step on the loop's ready queue. Everything here is
//! single-threaded, so the waker is built on `Rc` rather than `Arc`.

use std::mem::ManuallyDrop;
use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Something that can put itself back on the ready queue.
pub(crate) trait Schedule {
    fn schedule(self: Rc<Self>);
}

/// Custom waker that re-schedules a task when awakened.
struct TaskWaker {
    task: Rc<dyn Schedule>,
}

impl TaskWaker {
    fn wake(&self) {
        self.task.clone().schedule();
    }

    unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
        let waker = ManuallyDrop::new(unsafe { Rc::from_raw(ptr as *const TaskWaker) });
        let cloned: Rc<TaskWaker> = Rc::clone(&waker);
        RawWaker::new(Rc::into_raw(cloned) as *const (), &Self::VTABLE)
    }

    unsafe fn wake_raw(ptr: *const ()) {
        let waker = unsafe { Rc::from_raw(ptr as *const TaskWaker) };
        waker.wake();
    }

    unsafe fn wake_by_ref_raw(ptr: *const ()) {
        let waker = ManuallyDrop::new(unsafe { Rc::from_raw(ptr as *const TaskWaker) });
        waker.wake();
    }

    unsafe fn drop_raw(ptr: *const ()) {
        drop(unsafe { Rc::from_raw(ptr as *const TaskWaker) });
    }

    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_raw,
        Self::wake_raw,
        Self::wake_by_ref_raw,
        Self::drop_raw,
    );
}

/// Creates a Waker that re-schedules `task` when woken.
///
/// The waker must stay on the loop's thread; the loop never hands it to
/// another thread.
pub(crate) fn make_waker(task: Rc<dyn Schedule>) -> Waker {
    let waker = Rc::new(TaskWaker { task });
    let raw = RawWaker::new(Rc::into_raw(waker) as *const (), &TaskWaker::VTABLE);
    unsafe { Waker::from_raw(raw) }
}
