//! The completion-driven backend.
//!
//! Every operation-initiating call registers its target with the port,
//! submits the request and returns a [`Future`] right away:
//!
//! - when the port finishes the request during submission, the completion
//!   callback runs immediately and the Future is already settled
//! - otherwise a [`PendingOperation`] is cached under the request's address
//!   and the Future stays pending until [`Proactor::poll`] sees the
//!   completion
//!
//! Each completion callback is an `FnOnce` that lives in exactly one place,
//! either the submitting call's stack or the cache, so an operation is
//! delivered at most once whichever path finishes it.

use crate::builder::Config;
use crate::error::{self, Error, Result};
use crate::future::{AnyFuture, Future};
use crate::proactor::handle::Handle;
use crate::proactor::overlapped::{Outcome, Request, Status};
use crate::proactor::pipe::PipeInstance;
use crate::proactor::port::{Port, Submitted};
use crate::runtime::handle::LoopHandle;

use log::{debug, trace};
use rustc_hash::FxHashMap;
use socket2::{SockAddr, Socket};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

const PIPE_CONNECT_INITIAL_DELAY: Duration = Duration::from_millis(1);
const PIPE_CONNECT_MAX_DELAY: Duration = Duration::from_millis(100);

type Deliver = Box<dyn FnOnce(Status) -> Result<()>>;

/// An operation the OS has not finished yet.
pub(crate) struct PendingOperation {
    future: Box<dyn AnyFuture>,
    /// The socket or pipe the operation runs on. `None` for operations run
    /// by worker threads, which cannot be cancelled.
    owner: Option<Handle>,
    deliver: Deliver,
}

/// Completion-based I/O backend.
pub struct Proactor {
    port: Rc<Port>,
    handle: Option<LoopHandle>,
    cache: FxHashMap<u64, PendingOperation>,
    results: Vec<Box<dyn AnyFuture>>,
    next_address: u64,
    config: Config,
}

impl fmt::Debug for Proactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proactor")
            .field("pending", &self.cache.len())
            .field("results", &self.results.len())
            .field("closed", &self.port.is_closed())
            .finish()
    }
}

impl Proactor {
    /// Creates a proactor with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Ok(Self {
            port: Rc::new(Port::new(config.max_events)?),
            handle: None,
            cache: FxHashMap::default(),
            results: Vec::new(),
            next_address: 1,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attaches the loop whose ready queue receives the Futures' callbacks.
    pub fn set_loop(&mut self, handle: &LoopHandle) {
        self.handle = Some(handle.clone());
    }

    pub fn is_closed(&self) -> bool {
        self.port.is_closed()
    }

    /// Number of operations waiting for a completion.
    pub fn pending_count(&self) -> usize {
        self.cache.len()
    }

    /// Starts reading up to `len` bytes from `handle`.
    ///
    /// Resolves with the bytes read; an empty buffer means end of stream.
    pub fn recv(&mut self, handle: &Handle, len: usize) -> Result<Future<Vec<u8>>> {
        self.submit(handle, Request::Recv { len }, |outcome| match outcome {
            Outcome::Received(data) => Ok(data),
            _ => Err(unexpected()),
        })
    }

    /// Starts writing `buf` to `handle`. Resolves with the byte count sent.
    pub fn send(&mut self, handle: &Handle, buf: Vec<u8>) -> Result<Future<usize>> {
        self.submit(handle, Request::Send { buf }, |outcome| match outcome {
            Outcome::Sent(count) => Ok(count),
            _ => Err(unexpected()),
        })
    }

    /// Starts accepting a connection on the listening `listener`.
    ///
    /// Resolves with the connection and the peer's address.
    pub fn accept(&mut self, listener: &Handle) -> Result<Future<(Handle, SockAddr)>> {
        self.submit(listener, Request::Accept, |outcome| match outcome {
            Outcome::Accepted(socket, peer) => Ok((Handle::new(socket)?, peer)),
            _ => Err(unexpected()),
        })
    }

    /// Starts connecting the unconnected stream `handle` to `address`.
    pub fn connect(&mut self, handle: &Handle, address: SocketAddr) -> Result<Future<()>> {
        let request = Request::Connect {
            address: SockAddr::from(address),
            started: false,
        };
        self.submit(handle, request, |outcome| match outcome {
            Outcome::Connected => Ok(()),
            _ => Err(unexpected()),
        })
    }

    /// Waits for a client to connect to `pipe`.
    ///
    /// Resolves with the same instance, now connected.
    pub fn accept_pipe(&mut self, pipe: &PipeInstance) -> Result<Future<PipeInstance>> {
        let handle = pipe.handle().ok_or_else(|| error::from_os(libc::EBADF))?;
        let pipe = pipe.clone();

        self.submit(&handle, Request::Accept, move |outcome| match outcome {
            Outcome::Accepted(socket, _) => {
                pipe.attach(socket)?;
                Ok(pipe)
            }
            _ => Err(unexpected()),
        })
    }

    /// Connects to the pipe server at `address` from a worker thread.
    ///
    /// The worker retries while nobody accepts, for at most the configured
    /// wait window, then fails with a connection-refused error. The attempt
    /// cannot be aborted: cancelling the Future only makes the proactor
    /// ignore the eventual completion.
    pub fn connect_pipe(&mut self, address: impl AsRef<Path>) -> Result<Future<Handle>> {
        let handle = self.loop_handle()?;
        let poster = self.port.poster()?;
        let address = address.as_ref().to_path_buf();
        let window = self.config.pipe_connect_timeout;

        let operation = self.allocate_address();
        let future = Future::new(&handle);
        let target = future.clone();
        let deliver: Deliver = Box::new(move |status| {
            settle(
                &target,
                match status {
                    Ok(Outcome::PipeConnected(socket)) => Handle::new(socket),
                    Ok(_) => Err(unexpected()),
                    Err(code) => Err(error::from_pipe_connect(code)),
                },
            )
        });

        // Cached before the worker starts, so its completion always finds
        // the entry.
        self.cache.insert(
            operation,
            PendingOperation {
                future: Box::new(future.clone()),
                owner: None,
                deliver,
            },
        );

        let spawned = thread::Builder::new()
            .name(String::from("pipe-connect"))
            .spawn(move || {
                let status = connect_with_retry(&address, window);
                poster.post(operation, status);
            });
        if let Err(error) = spawned {
            self.cache.remove(&operation);
            return Err(error.into());
        }

        trace!("connect_pipe parked as {operation:#x}");
        Ok(future)
    }

    /// Marks `handle` as no longer served and closes it.
    ///
    /// Operations still pending on it end up cancelled instead of failing
    /// with an abort error.
    pub fn stop_serving(&mut self, handle: &Handle) {
        handle.mark_stopped_serving();
        handle.close();
    }

    /// Polls for completions unless some are already buffered, then returns
    /// the Futures settled since the previous call.
    pub fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<Box<dyn AnyFuture>>> {
        if self.results.is_empty() {
            self.poll(timeout)?;
        }
        Ok(std::mem::take(&mut self.results))
    }

    /// Waits up to `timeout` (forever for `None`) for one completion, then
    /// drains every completion already available without blocking.
    ///
    /// Returns the number of completions seen, stale ones included.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut timeout = validate_timeout(timeout)?;
        let mut seen = 0;

        while let Some(completion) = self.port.wait(timeout)? {
            seen += 1;
            timeout = Some(Duration::ZERO);

            let Some(operation) = self.cache.remove(&completion.address) else {
                debug!("ignoring stale completion for {:#x}", completion.address);
                continue;
            };
            let PendingOperation {
                future,
                owner,
                deliver,
            } = operation;

            if owner.as_ref().is_some_and(Handle::stopped_serving) {
                if future.cancel() {
                    self.results.push(future);
                }
            } else if future.cancelled() {
                trace!("completion for cancelled {:#x} ignored", completion.address);
            } else {
                deliver(completion.status)?;
                self.results.push(future);
            }
        }

        Ok(seen)
    }

    /// Cancels every pending operation and waits until each one has been
    /// accounted for, then releases the completion port. Closing twice is
    /// harmless; every later operation fails with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        if self.port.is_closed() {
            return Ok(());
        }

        for operation in self.cache.values() {
            operation.future.cancel();
        }
        // Worker-thread operations cannot be aborted; forget them.
        self.cache.retain(|_, operation| operation.owner.is_some());

        let started = Instant::now();
        while !self.cache.is_empty() {
            if self.poll(Some(self.config.close_poll_interval))? == 0 {
                debug!(
                    "{} operations still pending {:.1}s after closing",
                    self.cache.len(),
                    started.elapsed().as_secs_f64()
                );
            }
        }

        self.results.clear();
        self.port.close();
        Ok(())
    }

    fn submit<T, F>(&mut self, handle: &Handle, request: Request, finish: F) -> Result<Future<T>>
    where
        T: 'static,
        F: FnOnce(Outcome) -> Result<T> + 'static,
    {
        let loop_handle = self.loop_handle()?;
        self.port.associate(handle)?;

        let address = self.allocate_address();
        let name = request.name();
        let future = self.operation_future(&loop_handle, address);

        match self.port.submit(address, handle, request)? {
            Submitted::Completed(status) => {
                trace!("{name} {address:#x} completed immediately");
                settle(&future, status.map_err(error::from_os).and_then(finish))?;
            }
            Submitted::Pending => {
                let target = future.clone();
                self.cache.insert(
                    address,
                    PendingOperation {
                        future: Box::new(future.clone()),
                        owner: Some(handle.clone()),
                        deliver: Box::new(move |status| {
                            settle(&target, status.map_err(error::from_os).and_then(finish))
                        }),
                    },
                );
            }
        }

        Ok(future)
    }

    fn loop_handle(&self) -> Result<LoopHandle> {
        if self.port.is_closed() {
            return Err(Error::Closed);
        }
        self.handle.clone().ok_or(Error::LoopNotSet)
    }

    fn allocate_address(&mut self) -> u64 {
        let address = self.next_address;
        self.next_address += 1;
        address
    }

    /// A Future whose cancellation asks the port to abort the request.
    fn operation_future<T: 'static>(&self, handle: &LoopHandle, address: u64) -> Future<T> {
        let port = Rc::downgrade(&self.port);
        Future::with_canceller(handle, move || {
            if let Some(port) = port.upgrade() {
                if let Err(error) = port.cancel(address) {
                    trace!("cancel of {address:#x} ignored: {error}");
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn poster(&self) -> Result<crate::proactor::port::Poster> {
        self.port.poster()
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            debug!("error while closing proactor on drop: {error}");
        }
    }
}

fn settle<T: 'static>(future: &Future<T>, outcome: Result<T>) -> Result<()> {
    match outcome {
        Ok(value) => future.set_result(value),
        Err(error) => future.set_exception(error),
    }
}

fn unexpected() -> Error {
    Error::InvalidState("completion does not match its request")
}

/// Converts `timeout` to the millisecond granularity of the wait.
///
/// Intervals that round to the "infinite" sentinel or above are rejected.
/// Negative intervals cannot be expressed with [`Duration`].
fn validate_timeout(timeout: Option<Duration>) -> Result<Option<Duration>> {
    let Some(timeout) = timeout else {
        return Ok(None);
    };
    let ms = (timeout.as_nanos() + 500_000) / 1_000_000;
    if ms >= u128::from(u32::MAX) {
        return Err(Error::InvalidTimeout("timeout too big"));
    }
    Ok(Some(Duration::from_millis(ms as u64)))
}

fn connect_with_retry(address: &Path, window: Duration) -> Status {
    let deadline = Instant::now() + window;
    let mut delay = PIPE_CONNECT_INITIAL_DELAY;

    loop {
        match UnixStream::connect(address) {
            Ok(stream) => {
                let socket = Socket::from(stream);
                return match socket.set_nonblocking(true) {
                    Ok(()) => Ok(Outcome::PipeConnected(socket)),
                    Err(error) => Err(error::errno(&error)),
                };
            }
            Err(error) if nobody_listening(&error) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(libc::ETIMEDOUT);
                }
                thread::sleep(delay.min(deadline - now));
                delay = (delay * 2).min(PIPE_CONNECT_MAX_DELAY);
            }
            Err(error) => return Err(error::errno(&error)),
        }
    }
}

fn nobody_listening(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::ECONNREFUSED) | Some(libc::EAGAIN)
    )
}

impl PendingOperation {
    #[cfg(test)]
    fn is_ownerless(&self) -> bool {
        self.owner.is_none()
    }
}
