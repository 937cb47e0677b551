//! Completion-based I/O backend.
//!
//! This module provides the proactor and the OS objects it operates on:
//! - [`core`]: The proactor, its pending-operation cache and polling loop
//! - [`port`]: Completion port emulated on top of a readiness poller
//! - [`overlapped`]: Requests the port performs and their outcomes
//! - [`handle`]: Reference-counted sockets registered with the port
//! - [`pipe`]: Pipe servers and their instances

pub mod core;
pub mod handle;
pub(crate) mod overlapped;
pub mod pipe;
pub(crate) mod port;

pub use self::core::Proactor;
pub use handle::Handle;
pub use pipe::{PipeInstance, PipeServer};
