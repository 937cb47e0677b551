//! OS objects that operations are issued against.
//!
//! A [`Handle`] wraps a non-blocking socket. Once an operation has been
//! issued on it, the handle is registered with the proactor's completion
//! port; closing the handle (explicitly or by dropping the last clone)
//! notifies the port first, which aborts the handle's in-flight operations
//! and removes it from the ownership table, and only then closes the
//! descriptor.

use crate::error::{Error, Result};
use crate::proactor::port::Port;

use socket2::{Domain, SockAddr, Socket, Type};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct HandleInner {
    id: u64,
    socket: RefCell<Option<Socket>>,
    registration: RefCell<Option<Weak<Port>>>,
    stopped_serving: Cell<bool>,
}

/// Shared, reference-counted OS object (socket or pipe end).
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

/// Non-owning reference kept by the port for in-flight operations.
#[derive(Clone)]
pub(crate) struct WeakHandle {
    inner: Weak<HandleInner>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("fd", &self.raw_fd().ok())
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Handle {}

impl Handle {
    /// Wraps `socket`, switching it to non-blocking mode.
    pub fn new(socket: Socket) -> Result<Self> {
        socket.set_nonblocking(true)?;

        Ok(Self {
            inner: Rc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                socket: RefCell::new(Some(socket)),
                registration: RefCell::new(None),
                stopped_serving: Cell::new(false),
            }),
        })
    }

    /// Creates an unconnected stream socket able to reach `address`.
    pub fn stream_for(address: &SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(*address), Type::STREAM, None)?;
        Self::new(socket)
    }

    /// Creates a listening TCP socket bound to `address`.
    pub fn listen(address: SocketAddr, backlog: i32) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(address))?;
        socket.listen(backlog)?;
        Self::new(socket)
    }

    /// A connected pair of Unix stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The descriptor, or `EBADF` once closed.
    pub fn raw_fd(&self) -> Result<RawFd> {
        self.with_socket(|socket| socket.as_raw_fd())
            .map_err(crate::error::from_os)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.socket.borrow().is_none()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let address = self.try_with_socket(|socket| socket.local_addr())?;
        inet(address)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let address = self.try_with_socket(|socket| socket.peer_addr())?;
        inet(address)
    }

    /// Closes the descriptor after notifying the port it is registered with.
    /// Closing twice is harmless.
    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn stopped_serving(&self) -> bool {
        self.inner.stopped_serving.get()
    }

    pub(crate) fn mark_stopped_serving(&self) {
        self.inner.stopped_serving.set(true);
    }

    /// Runs `f` on the open socket, or reports `EBADF`.
    pub(crate) fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> R) -> Result<R, i32> {
        match self.inner.socket.borrow().as_ref() {
            Some(socket) => Ok(f(socket)),
            None => Err(libc::EBADF),
        }
    }

    fn try_with_socket<R>(&self, f: impl FnOnce(&Socket) -> std::io::Result<R>) -> Result<R> {
        self.with_socket(f)
            .map_err(crate::error::from_os)?
            .map_err(Error::from)
    }

    /// Whether the handle is registered with `port`.
    pub(crate) fn is_registered_with(&self, port: &Rc<Port>) -> bool {
        match self.inner.registration.borrow().as_ref() {
            Some(registered) => Weak::ptr_eq(registered, &Rc::downgrade(port)),
            None => false,
        }
    }

    pub(crate) fn set_registration(&self, port: Weak<Port>) {
        *self.inner.registration.borrow_mut() = Some(port);
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<Handle> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }
}

impl HandleInner {
    fn close(&self) {
        let fd = match self.socket.borrow().as_ref() {
            Some(socket) => socket.as_raw_fd(),
            None => return,
        };

        let registration = self.registration.borrow_mut().take();
        if let Some(port) = registration.and_then(|port| port.upgrade()) {
            port.disassociate(fd, self.id);
        }

        drop(self.socket.borrow_mut().take());
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl TryFrom<TcpStream> for Handle {
    type Error = Error;

    fn try_from(stream: TcpStream) -> Result<Self> {
        Self::new(Socket::from(stream))
    }
}

impl TryFrom<TcpListener> for Handle {
    type Error = Error;

    fn try_from(listener: TcpListener) -> Result<Self> {
        Self::new(Socket::from(listener))
    }
}

impl TryFrom<UnixStream> for Handle {
    type Error = Error;

    fn try_from(stream: UnixStream) -> Result<Self> {
        Self::new(Socket::from(stream))
    }
}

fn inet(address: SockAddr) -> Result<SocketAddr> {
    address.as_socket().ok_or(Error::Io {
        kind: std::io::ErrorKind::InvalidInput,
        message: String::from("not an inet address"),
    })
}
