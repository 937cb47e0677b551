//! The contract between the event loop and the I/O backend driving it.
//!
//! A loop is built around exactly one backend and keeps it for its whole
//! life. [`Proactor`] is the completion-based implementation; a
//! readiness-based one would implement the same trait.

use crate::builder::Config;
use crate::error::Result;
use crate::future::{AnyFuture, Future};
use crate::proactor::{Handle, PipeInstance, Proactor};
use crate::runtime::handle::LoopHandle;

use socket2::SockAddr;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub trait Backend {
    /// Attaches the loop whose ready queue receives completion callbacks.
    fn set_loop(&mut self, handle: &LoopHandle);

    /// Waits up to `timeout` for I/O and returns the Futures settled by it.
    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<Box<dyn AnyFuture>>>;

    fn recv(&mut self, handle: &Handle, len: usize) -> Result<Future<Vec<u8>>>;

    fn send(&mut self, handle: &Handle, buf: Vec<u8>) -> Result<Future<usize>>;

    fn accept(&mut self, listener: &Handle) -> Result<Future<(Handle, SockAddr)>>;

    fn connect(&mut self, handle: &Handle, address: SocketAddr) -> Result<Future<()>>;

    fn accept_pipe(&mut self, pipe: &PipeInstance) -> Result<Future<PipeInstance>>;

    fn connect_pipe(&mut self, address: &Path) -> Result<Future<Handle>>;

    /// Stops serving `handle` and closes it; its pending operations end
    /// up cancelled.
    fn stop_serving(&mut self, handle: &Handle);

    fn close(&mut self) -> Result<()>;

    fn config(&self) -> &Config;
}

impl Backend for Proactor {
    fn set_loop(&mut self, handle: &LoopHandle) {
        Proactor::set_loop(self, handle);
    }

    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<Box<dyn AnyFuture>>> {
        Proactor::select(self, timeout)
    }

    fn recv(&mut self, handle: &Handle, len: usize) -> Result<Future<Vec<u8>>> {
        Proactor::recv(self, handle, len)
    }

    fn send(&mut self, handle: &Handle, buf: Vec<u8>) -> Result<Future<usize>> {
        Proactor::send(self, handle, buf)
    }

    fn accept(&mut self, listener: &Handle) -> Result<Future<(Handle, SockAddr)>> {
        Proactor::accept(self, listener)
    }

    fn connect(&mut self, handle: &Handle, address: SocketAddr) -> Result<Future<()>> {
        Proactor::connect(self, handle, address)
    }

    fn accept_pipe(&mut self, pipe: &PipeInstance) -> Result<Future<PipeInstance>> {
        Proactor::accept_pipe(self, pipe)
    }

    fn connect_pipe(&mut self, address: &Path) -> Result<Future<Handle>> {
        Proactor::connect_pipe(self, address)
    }

    fn stop_serving(&mut self, handle: &Handle) {
        Proactor::stop_serving(self, handle);
    }

    fn close(&mut self) -> Result<()> {
        Proactor::close(self)
    }

    fn config(&self) -> &Config {
        Proactor::config(self)
    }
}
