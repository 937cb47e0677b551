//! Completion-based async I/O runtime.
//!
//! A single thread drives many concurrent socket and pipe operations. The
//! OS performs the I/O and reports finished operations; the loop resolves
//! the matching Futures and resumes the tasks waiting on them.
//!
//! # Architecture
//!
//! - **EventLoop**: Ready queue, timers and one backend, stepped by `run_once`
//! - **Proactor**: Completion-based backend with its pending-operation cache
//! - **Future**: Single-resolution result cell settled exactly once
//! - **Task**: Suspended computation bound to a Future, stepped by the loop
//! - **PipeServer**: Listener that always keeps one unconnected instance posted
//! - **RuntimeBuilder**: Fluent builder for loops and proactors
//!
//! # Example
//! ```ignore
//! use ioloop::{EventLoop, Handle};
//!
//! let event_loop = EventLoop::new()?;
//! let (a, b) = Handle::pair()?;
//! let io = event_loop.clone();
//! let data = event_loop.run_until_complete(async move {
//!     io.sock_sendall(&a, b"ping".to_vec()).await?;
//!     io.sock_recv(&b, 4)?.await
//! })?;
//! assert_eq!(data, b"ping");
//! ```

mod backend;
mod builder;
mod error;
mod future;
pub mod proactor;
mod runtime;
mod task;
mod timer;

pub use backend::Backend;
pub use builder::{Config, RuntimeBuilder};
pub use error::{Error, Result};
pub use future::{AnyFuture, Future};
pub use proactor::{Handle, PipeInstance, PipeServer, Proactor};
pub use runtime::{Callback, EventLoop, LoopHandle, ServingPipe, current};
pub use task::Task;
pub use timer::{TimerHandle, sleep, sleep_on};

/// Spawns a computation on the loop running on this thread.
///
/// # Panics
/// Panics if called outside of a running event loop.
///
/// # Example
/// ```ignore
/// event_loop.run_until_complete(async {
///     let child = ioloop::spawn(async { Ok(1) });
///     child.await
/// })?;
/// ```
pub fn spawn<T, F>(computation: F) -> Task<T>
where
    T: 'static,
    F: std::future::Future<Output = Result<T>> + 'static,
{
    Task::spawn(computation)
}
