//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub(crate) mod handle;
pub(crate) mod queue;
pub(crate) mod waker;

pub use self::core::{EventLoop, ServingPipe};
pub use context::current;
pub use handle::LoopHandle;
pub use queue::Callback;
