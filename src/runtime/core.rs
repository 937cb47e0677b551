//! The event loop: ready queue, timers and one I/O backend.
//!
//! Each iteration of [`EventLoop::run_once`]:
//!
//! 1. Computes how long the backend may block: not at all when callbacks
//!    are ready or a stop was requested, until the earliest timer otherwise,
//!    forever when there is nothing else to wait for
//! 2. Lets the backend wait for completions and settle their Futures, which
//!    pushes their callbacks onto the ready queue
//! 3. Moves expired timers onto the ready queue
//! 4. Runs exactly the callbacks that were ready when draining started, in
//!    FIFO order
//!
//! Callbacks scheduled while draining run on the next iteration, so I/O
//! delivery and task resumption interleave deterministically.

use crate::backend::Backend;
use crate::builder::RuntimeBuilder;
use crate::error::{Error, Result};
use crate::future::Future;
use crate::proactor::{Handle, PipeInstance, PipeServer, Proactor};
use crate::runtime::context::enter_context;
use crate::runtime::handle::LoopHandle;
use crate::task::Task;
use crate::timer::TimerHandle;

use log::{error, trace};
use socket2::SockAddr;

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Upper bound on a single backend wait, so a far-away timer cannot turn
/// into an oversized timeout.
const MAX_SELECT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Single-threaded event loop over a [`Backend`].
///
/// Cloning yields another handle to the same loop.
pub struct EventLoop<B: Backend = Proactor> {
    handle: LoopHandle,
    backend: Rc<RefCell<B>>,
}

impl<B: Backend> Clone for EventLoop<B> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for EventLoop<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .finish()
    }
}

impl EventLoop<Proactor> {
    /// Creates a proactor-driven loop with the default configuration.
    ///
    /// # Example
    /// ```ignore
    /// let event_loop = EventLoop::new()?;
    /// let value = event_loop.run_until_complete(async { Ok(42) })?;
    /// ```
    pub fn new() -> Result<Self> {
        RuntimeBuilder::new().build()
    }
}

impl<B: Backend + 'static> EventLoop<B> {
    /// Creates a loop around `backend` and attaches the backend to it.
    pub fn with_backend(mut backend: B) -> Result<Self> {
        let handle = LoopHandle::new();
        backend.set_loop(&handle);

        Ok(Self {
            handle,
            backend: Rc::new(RefCell::new(backend)),
        })
    }

    /// The backend-agnostic half of the loop, as held by Futures.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn time(&self) -> Instant {
        self.handle.time()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn call_soon<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.handle.call_soon(callback);
    }

    pub fn call_later<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.handle.call_later(delay, callback)
    }

    pub fn call_at<F>(&self, when: Instant, callback: F) -> TimerHandle
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.handle.call_at(when, callback)
    }

    /// Spawns `computation` as a task on this loop.
    pub fn spawn<T, F>(&self, computation: F) -> Task<T>
    where
        T: 'static,
        F: std::future::Future<Output = Result<T>> + 'static,
    {
        self.handle.spawn(computation)
    }

    /// Asks a running loop to return once the current iteration ends.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Runs a single iteration of the loop.
    pub fn run_once(&self) -> Result<()> {
        let shared = &self.handle.shared;

        let timeout = if !shared.ready.is_empty() || shared.stopping.get() {
            Some(Duration::ZERO)
        } else {
            shared.timers.next_deadline().map(|deadline| {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(MAX_SELECT_TIMEOUT)
            })
        };

        let settled = self.backend.borrow_mut().select(timeout)?;
        if !settled.is_empty() {
            trace!("{} futures settled by I/O", settled.len());
        }

        for callback in shared.timers.take_expired(Instant::now()) {
            self.handle.call_soon_boxed(callback);
        }

        shared.ready.run_pending()
    }

    /// Runs iterations until [`stop`](Self::stop) is called or a callback
    /// fails.
    pub fn run_forever(&self) -> Result<()> {
        let shared = &self.handle.shared;
        if shared.running.get() {
            return Err(Error::InvalidState("event loop is already running"));
        }

        shared.running.set(true);
        let result = enter_context(&self.handle, || {
            loop {
                self.run_once()?;
                if shared.stopping.get() {
                    return Ok(());
                }
            }
        });
        shared.stopping.set(false);
        shared.running.set(false);

        result
    }

    /// Runs the loop until `computation` finishes and returns its outcome.
    pub fn run_until_complete<T, F>(&self, computation: F) -> Result<T>
    where
        T: 'static,
        F: std::future::Future<Output = Result<T>> + 'static,
    {
        if self.is_running() {
            return Err(Error::InvalidState("event loop is already running"));
        }

        let task = self.spawn(computation);
        let handle = self.handle.clone();
        task.future().add_done_callback(move |_| handle.stop());

        self.run_forever()?;

        if !task.done() {
            return Err(Error::InvalidState(
                "event loop stopped before the computation completed",
            ));
        }
        task.future().take_result()
    }

    /// Closes the backend and forgets every queued callback and timer.
    /// Closing twice is harmless.
    pub fn close(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::InvalidState("cannot close a running event loop"));
        }
        self.backend.borrow_mut().close()?;
        self.handle.shared.ready.clear();
        self.handle.shared.timers.clear();
        Ok(())
    }

    /// Reads up to `len` bytes from `handle`.
    pub fn sock_recv(&self, handle: &Handle, len: usize) -> Result<Future<Vec<u8>>> {
        self.backend.borrow_mut().recv(handle, len)
    }

    /// Writes all of `data` to `handle`, issuing as many sends as needed.
    pub fn sock_sendall(
        &self,
        handle: &Handle,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + use<B> {
        let backend = self.backend.clone();
        let handle = handle.clone();

        async move {
            let mut offset = 0;
            while offset < data.len() {
                let sent = backend.borrow_mut().send(&handle, data[offset..].to_vec())?;
                offset += sent.await?;
            }
            Ok(())
        }
    }

    /// Accepts a connection on the listening `listener`.
    pub fn sock_accept(&self, listener: &Handle) -> Result<Future<(Handle, SockAddr)>> {
        self.backend.borrow_mut().accept(listener)
    }

    pub fn sock_connect(&self, handle: &Handle, address: SocketAddr) -> Result<Future<()>> {
        self.backend.borrow_mut().connect(handle, address)
    }

    /// Connects to the pipe server listening at `address`.
    pub fn create_pipe_connection(&self, address: impl AsRef<Path>) -> Result<Future<Handle>> {
        self.backend.borrow_mut().connect_pipe(address.as_ref())
    }

    /// Accepts connections on `listener` until it is closed or stopped,
    /// handing each one to `on_connection`.
    pub fn start_serving<F>(&self, listener: Handle, mut on_connection: F) -> Task<()>
    where
        F: FnMut(Handle, SockAddr) + 'static,
    {
        let backend = self.backend.clone();

        self.spawn(async move {
            loop {
                let accepted = match backend.borrow_mut().accept(&listener) {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        serving_failed(&listener, &error);
                        return Ok(());
                    }
                };

                match accepted.await {
                    Ok((connection, peer)) => on_connection(connection, peer),
                    Err(Error::Cancelled) => {
                        listener.close();
                        return Ok(());
                    }
                    Err(error) => {
                        serving_failed(&listener, &error);
                        return Ok(());
                    }
                }
            }
        })
    }

    /// Stops serving `handle` and closes it. A pending accept on it ends up
    /// cancelled.
    pub fn stop_serving(&self, handle: &Handle) {
        self.backend.borrow_mut().stop_serving(handle);
    }

    /// Creates a pipe server at `address` and hands each connected instance
    /// to `on_connection`.
    ///
    /// The returned [`ServingPipe`] owns the server: closing or dropping it
    /// closes the free instances, which ends the accept loop.
    pub fn start_serving_pipe<F>(
        &self,
        address: impl AsRef<Path>,
        mut on_connection: F,
    ) -> Result<ServingPipe>
    where
        F: FnMut(PipeInstance) + 'static,
    {
        let backlog = self.backend.borrow().config().pipe_backlog;
        let server = Rc::new(RefCell::new(PipeServer::new(address, backlog)?));
        let weak: Weak<RefCell<PipeServer>> = Rc::downgrade(&server);
        let backend = self.backend.clone();

        let task = self.spawn(async move {
            loop {
                let Some(server) = weak.upgrade() else {
                    return Ok(());
                };
                let pipe = match server.borrow_mut().get_unconnected_pipe() {
                    Ok(Some(pipe)) => pipe,
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        error!("failed to create a pipe instance: {err}");
                        return Ok(());
                    }
                };
                drop(server);

                let accepted = match backend.borrow_mut().accept_pipe(&pipe) {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        pipe_failed(&pipe, &err);
                        return Ok(());
                    }
                };

                match accepted.await {
                    Ok(pipe) => on_connection(pipe),
                    Err(Error::Cancelled) => {
                        pipe.close();
                        return Ok(());
                    }
                    Err(err) => {
                        pipe_failed(&pipe, &err);
                        return Ok(());
                    }
                }
            }
        });

        Ok(ServingPipe { server, task })
    }
}

fn serving_failed(listener: &Handle, err: &Error) {
    if !listener.is_closed() {
        error!("accept failed on {listener:?}: {err}");
        listener.close();
    }
}

/// A failure on an instance closed by its server only means the server
/// went away.
fn pipe_failed(pipe: &PipeInstance, err: &Error) {
    if !pipe.is_closed() {
        error!("pipe accept failed on {pipe:?}: {err}");
        pipe.close();
    }
}

/// A pipe server together with its accept loop.
pub struct ServingPipe {
    server: Rc<RefCell<PipeServer>>,
    task: Task<()>,
}

impl fmt::Debug for ServingPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingPipe")
            .field("server", &self.server.borrow())
            .finish()
    }
}

impl ServingPipe {
    pub fn address(&self) -> std::path::PathBuf {
        self.server.borrow().address().to_path_buf()
    }

    pub fn is_closed(&self) -> bool {
        self.server.borrow().is_closed()
    }

    /// The accept loop. It finishes once the server is closed.
    pub fn task(&self) -> &Task<()> {
        &self.task
    }

    pub fn close(&self) {
        self.server.borrow_mut().close();
    }
}

impl Drop for ServingPipe {
    fn drop(&mut self) {
        self.close();
    }
}
