//! Pipe servers built on Unix domain stream sockets.
//!
//! A [`PipeServer`] binds a listening socket at a filesystem path. Each
//! [`PipeInstance`] is a duplicate of that listening descriptor, so instances
//! can be handed to [`Proactor::accept_pipe`](crate::Proactor::accept_pipe)
//! and closed independently. Once a client connects, the instance swaps its
//! listening duplicate for the accepted stream.
//!
//! While the server is open exactly one unconnected instance is posted, so a
//! client never arrives while nobody is listening.

use crate::error::Result;
use crate::proactor::handle::Handle;

use log::{debug, trace};
use socket2::{Domain, SockAddr, Socket, Type};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

struct PipeInner {
    id: u64,
    handle: RefCell<Option<Handle>>,
    connected: Cell<bool>,
}

/// One end of a pipe server: listening until a client connects, then the
/// server side of that connection.
#[derive(Clone)]
pub struct PipeInstance {
    inner: Rc<PipeInner>,
}

impl fmt::Debug for PipeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeInstance")
            .field("id", &self.inner.id)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PipeInstance {
    fn new(handle: Handle) -> Self {
        Self {
            inner: Rc::new(PipeInner {
                id: handle.id(),
                handle: RefCell::new(Some(handle)),
                connected: Cell::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    pub fn is_closed(&self) -> bool {
        match self.inner.handle.borrow().as_ref() {
            Some(handle) => handle.is_closed(),
            None => true,
        }
    }

    /// The descriptor currently behind the instance, if still open.
    pub fn handle(&self) -> Option<Handle> {
        self.inner.handle.borrow().clone()
    }

    pub fn close(&self) {
        let handle = self.inner.handle.borrow_mut().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Replaces the listening duplicate with the accepted client stream.
    pub(crate) fn attach(&self, stream: Socket) -> Result<()> {
        let stream = Handle::new(stream)?;
        let previous = self.inner.handle.borrow_mut().replace(stream);
        if let Some(previous) = previous {
            previous.close();
        }
        self.inner.connected.set(true);
        trace!("pipe instance {} connected", self.inner.id);
        Ok(())
    }

    fn is_free(&self) -> bool {
        !self.is_connected() && !self.is_closed()
    }
}

/// Listener at a pipe address.
pub struct PipeServer {
    address: PathBuf,
    listener: Option<Socket>,
    posted: Option<PipeInstance>,
    /// Every unconnected instance created so far. Membership is advisory:
    /// instances drop out once closed, connected or released.
    instances: Vec<Weak<PipeInner>>,
}

impl fmt::Debug for PipeServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeServer")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PipeServer {
    /// Binds `address` and posts the first instance.
    ///
    /// Fails with `EADDRINUSE` if something already exists at the path.
    pub fn new(address: impl AsRef<Path>, backlog: i32) -> Result<Self> {
        let address = address.as_ref().to_path_buf();
        let listener = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        listener.bind(&SockAddr::unix(&address)?)?;
        listener.listen(backlog)?;

        let mut server = Self {
            address,
            listener: Some(listener),
            posted: None,
            instances: Vec::new(),
        };
        server.posted = server.new_instance()?;
        Ok(server)
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }

    /// The instance currently posted for the next client.
    pub fn posted(&self) -> Option<&PipeInstance> {
        self.posted.as_ref()
    }

    /// Hands out the posted instance after posting a replacement.
    ///
    /// Returns `None` once the server is closed.
    pub fn get_unconnected_pipe(&mut self) -> Result<Option<PipeInstance>> {
        if self.is_closed() {
            return Ok(None);
        }
        let replacement = self.new_instance()?;
        Ok(std::mem::replace(&mut self.posted, replacement))
    }

    /// Number of instances that are still open and waiting for a client,
    /// the posted one included.
    pub fn free_count(&mut self) -> usize {
        self.prune();
        self.instances.len()
    }

    /// Closes every instance no client has connected to, then removes the
    /// address. Connected instances belong to their transports and stay
    /// open. Closing twice is harmless.
    pub fn close(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        for instance in self.instances.drain(..) {
            if let Some(inner) = instance.upgrade() {
                let instance = PipeInstance { inner };
                if !instance.is_connected() {
                    instance.close();
                }
            }
        }
        self.posted = None;
        drop(listener);

        match std::fs::remove_file(&self.address) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => debug!("failed to remove {}: {error}", self.address.display()),
        }
    }

    fn new_instance(&mut self) -> Result<Option<PipeInstance>> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(None);
        };
        let instance = PipeInstance::new(Handle::new(listener.try_clone()?)?);

        self.prune();
        self.instances.push(Rc::downgrade(&instance.inner));
        Ok(Some(instance))
    }

    fn prune(&mut self) {
        self.instances.retain(|instance| match instance.upgrade() {
            Some(inner) => PipeInstance { inner }.is_free(),
            None => false,
        });
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn address_is_bound_by_the_first_server_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");

        let server = PipeServer::new(&path, 8).unwrap();
        assert!(path.exists());

        let error = PipeServer::new(&path, 8).unwrap_err();
        assert_eq!(error.os_code(), Some(libc::EADDRINUSE));
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn close_releases_free_instances_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mut server = PipeServer::new(&path, 8).unwrap();

        let free = server.get_unconnected_pipe().unwrap().unwrap();
        let connected = server.get_unconnected_pipe().unwrap().unwrap();
        let (stream, _) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        connected.attach(stream).unwrap();

        server.close();
        server.close();

        assert!(free.is_closed());
        assert!(!connected.is_closed());
        assert!(server.posted().is_none());
        assert!(server.get_unconnected_pipe().unwrap().is_none());
        assert!(UnixStream::connect(&path).is_err());
    }

    #[test]
    fn instances_share_one_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe");
        let mut server = PipeServer::new(&path, 8).unwrap();
        let instance = server.get_unconnected_pipe().unwrap().unwrap();

        let _client = UnixStream::connect(&path).unwrap();

        let accepted = instance
            .handle()
            .unwrap()
            .with_socket(|socket| socket.accept().map(|(socket, _)| socket))
            .unwrap();
        assert!(accepted.is_ok());
    }
}
