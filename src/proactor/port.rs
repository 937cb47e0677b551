//! Emulated completion port.
//!
//! The port turns readiness notifications into completions. Requests are
//! attempted as soon as they are submitted; the ones that cannot finish yet
//! are parked per descriptor, in FIFO order per direction, until the poller
//! reports the descriptor ready. Each finished request becomes a
//! [`Completion`] keyed by the address it was submitted under.
//!
//! Worker threads deliver completions through a [`Poster`], which wakes the
//! poller so the loop thread picks them up at the same wait point.

use crate::error::{Error, Result};
use crate::proactor::handle::{Handle, WeakHandle};
use crate::proactor::overlapped::{Attempt, Direction, Request, Status};

use log::{trace, warn};
use polling::{Event, Poller};
use rustc_hash::FxHashMap;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// A finished request.
pub(crate) struct Completion {
    pub(crate) address: u64,
    pub(crate) status: Status,
}

/// What happened to a submitted request.
pub(crate) enum Submitted {
    /// Finished during submission. Nothing was kept in the port.
    Completed(Status),
    /// Parked until its descriptor becomes ready.
    Pending,
}

struct InFlight {
    handle: WeakHandle,
    fd: RawFd,
    request: Request,
}

struct Registration {
    id: u64,
    reads: VecDeque<u64>,
    writes: VecDeque<u64>,
}

impl Registration {
    fn queue(&mut self, direction: Direction) -> &mut VecDeque<u64> {
        match direction {
            Direction::Read => &mut self.reads,
            Direction::Write => &mut self.writes,
        }
    }

    fn interest(&self, fd: RawFd) -> Event {
        Event {
            key: fd as usize,
            readable: !self.reads.is_empty(),
            writable: !self.writes.is_empty(),
        }
    }
}

#[derive(Default)]
struct State {
    registrations: FxHashMap<RawFd, Registration>,
    inflight: FxHashMap<u64, InFlight>,
    ready: VecDeque<Completion>,
}

pub(crate) struct Port {
    poller: RefCell<Option<Arc<Poller>>>,
    posted: RefCell<Option<Receiver<Completion>>>,
    sender: Sender<Completion>,
    state: RefCell<State>,
    events: RefCell<Vec<Event>>,
}

/// Thread-safe sender of completions into a port.
#[derive(Clone)]
pub(crate) struct Poster {
    sender: Sender<Completion>,
    poller: Weak<Poller>,
}

impl Poster {
    /// Queues `status` for `address` and wakes the port.
    ///
    /// Once the port is closed the completion is dropped, together with any
    /// socket it carries.
    pub(crate) fn post(&self, address: u64, status: Status) -> bool {
        if self.sender.send(Completion { address, status }).is_err() {
            warn!("completion for {address:#x} posted to a closed port");
            return false;
        }
        match self.poller.upgrade() {
            Some(poller) => {
                if let Err(error) = poller.notify() {
                    warn!("failed to wake the port: {error}");
                }
                true
            }
            None => false,
        }
    }
}

impl Port {
    pub(crate) fn new(max_events: usize) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            poller: RefCell::new(Some(Arc::new(Poller::new()?))),
            posted: RefCell::new(Some(receiver)),
            sender,
            state: RefCell::new(State::default()),
            events: RefCell::new(Vec::with_capacity(max_events)),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.poller.borrow().is_none()
    }

    fn poller(&self) -> Result<Arc<Poller>> {
        self.poller.borrow().clone().ok_or(Error::Closed)
    }

    /// Registers `handle` with the port. Registering twice is a no-op.
    pub(crate) fn associate(self: &Rc<Self>, handle: &Handle) -> Result<()> {
        if handle.is_registered_with(self) {
            return Ok(());
        }
        let fd = handle.raw_fd()?;
        self.poller()?.add(fd, Event::none(fd as usize))?;

        self.state.borrow_mut().registrations.insert(
            fd,
            Registration {
                id: handle.id(),
                reads: VecDeque::new(),
                writes: VecDeque::new(),
            },
        );
        handle.set_registration(Rc::downgrade(self));

        trace!("associated handle {} (fd {fd})", handle.id());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_associated(self: &Rc<Self>, handle: &Handle) -> bool {
        handle.is_registered_with(self)
    }

    /// Starts `request` on `handle` under `address`.
    ///
    /// The handle must be associated. A request queued behind another one of
    /// the same direction is not attempted before it.
    pub(crate) fn submit(
        &self,
        address: u64,
        handle: &Handle,
        mut request: Request,
    ) -> Result<Submitted> {
        let poller = self.poller()?;
        let fd = handle.raw_fd()?;
        let direction = request.direction();

        let mut state = self.state.borrow_mut();
        let registration = match state.registrations.get_mut(&fd) {
            Some(registration) if registration.id == handle.id() => registration,
            _ => return Err(Error::InvalidState("handle is not associated with the port")),
        };

        if registration.queue(direction).is_empty() {
            match handle.with_socket(|socket| request.attempt(socket)) {
                Ok(Attempt::Done(status)) => return Ok(Submitted::Completed(status)),
                Ok(Attempt::WouldBlock) => {}
                Err(code) => return Ok(Submitted::Completed(Err(code))),
            }
        }

        trace!("{} on fd {fd} parked as {address:#x}", request.name());
        registration.queue(direction).push_back(address);
        let interest = registration.interest(fd);
        state.inflight.insert(
            address,
            InFlight {
                handle: handle.downgrade(),
                fd,
                request,
            },
        );
        drop(state);

        poller.modify(fd, interest)?;
        Ok(Submitted::Pending)
    }

    /// Number of requests still waiting for their descriptor.
    #[cfg(test)]
    pub(crate) fn inflight_count(&self) -> usize {
        self.state.borrow().inflight.len()
    }

    /// Returns the next completion, waiting up to `timeout` (forever if
    /// `None`) for one to arrive.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Option<Completion>> {
        let poller = self.poller()?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if let Some(completion) = self.next_ready() {
                return Ok(Some(completion));
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let mut events = self.events.borrow_mut();
            events.clear();
            match poller.wait(&mut events, remaining) {
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
            let ready: Vec<RawFd> = events.iter().map(|event| event.key as RawFd).collect();
            drop(events);

            for fd in ready {
                self.drive(fd, Direction::Read);
                self.drive(fd, Direction::Write);
                self.rearm(&poller, fd);
            }

            if let Some(completion) = self.next_ready() {
                return Ok(Some(completion));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
        }
    }

    fn next_ready(&self) -> Option<Completion> {
        let mut state = self.state.borrow_mut();
        if let Some(receiver) = self.posted.borrow().as_ref() {
            state.ready.extend(receiver.try_iter());
        }
        state.ready.pop_front()
    }

    /// Performs the parked requests of one direction until one would block.
    fn drive(&self, fd: RawFd, direction: Direction) {
        loop {
            let (address, handle) = {
                let mut state = self.state.borrow_mut();
                let Some(registration) = state.registrations.get_mut(&fd) else {
                    return;
                };
                let Some(&address) = registration.queue(direction).front() else {
                    return;
                };
                let handle = state
                    .inflight
                    .get(&address)
                    .and_then(|inflight| inflight.handle.upgrade());
                (address, handle)
            };

            let status = match &handle {
                Some(handle) => {
                    let mut state = self.state.borrow_mut();
                    let Some(inflight) = state.inflight.get_mut(&address) else {
                        return;
                    };
                    match handle.with_socket(|socket| inflight.request.attempt(socket)) {
                        Ok(Attempt::WouldBlock) => None,
                        Ok(Attempt::Done(status)) => Some(status),
                        Err(code) => Some(Err(code)),
                    }
                }
                None => Some(Err(libc::EBADF)),
            };
            drop(handle);

            match status {
                Some(status) => self.finish(address, status),
                None => return,
            }
        }
    }

    /// Moves an in-flight request to the completion queue.
    fn finish(&self, address: u64, status: Status) {
        let mut state = self.state.borrow_mut();
        let Some(inflight) = state.inflight.remove(&address) else {
            return;
        };
        if let Some(registration) = state.registrations.get_mut(&inflight.fd) {
            let direction = inflight.request.direction();
            registration.queue(direction).retain(|&queued| queued != address);
        }
        state.ready.push_back(Completion { address, status });
    }

    fn rearm(&self, poller: &Poller, fd: RawFd) {
        let interest = match self.state.borrow().registrations.get(&fd) {
            Some(registration) => registration.interest(fd),
            None => return,
        };
        if let Err(error) = poller.modify(fd, interest) {
            warn!("failed to re-arm fd {fd}: {error}");
        }
    }

    /// Withdraws an in-flight request. The request still completes, with
    /// `ECANCELED`. Fails with `ENOENT` if the request already finished.
    pub(crate) fn cancel(&self, address: u64) -> Result<()> {
        let fd = match self.state.borrow().inflight.get(&address) {
            Some(inflight) => inflight.fd,
            None => return Err(crate::error::from_os(libc::ENOENT)),
        };
        self.finish(address, Err(libc::ECANCELED));

        if let Ok(poller) = self.poller() {
            self.rearm(&poller, fd);
        }
        Ok(())
    }

    /// Close notification for `fd`, owned by the handle with `id`.
    ///
    /// Every request still parked on the descriptor completes with
    /// `ECANCELED` and the descriptor leaves the poller.
    pub(crate) fn disassociate(&self, fd: RawFd, id: u64) {
        let mut state = self.state.borrow_mut();
        match state.registrations.get(&fd) {
            Some(registration) if registration.id == id => {}
            _ => return,
        }
        let Some(registration) = state.registrations.remove(&fd) else {
            return;
        };

        for address in registration.reads.into_iter().chain(registration.writes) {
            if state.inflight.remove(&address).is_some() {
                state.ready.push_back(Completion {
                    address,
                    status: Err(libc::ECANCELED),
                });
            }
        }
        drop(state);

        if let Ok(poller) = self.poller() {
            if let Err(error) = poller.delete(fd) {
                trace!("fd {fd} was not in the poller: {error}");
            }
        }
        trace!("disassociated handle {id} (fd {fd})");
    }

    pub(crate) fn poster(&self) -> Result<Poster> {
        let poller = self.poller()?;
        Ok(Poster {
            sender: self.sender.clone(),
            poller: Arc::downgrade(&poller),
        })
    }

    /// Releases the poller and the posted-completion receiver. Later calls
    /// do nothing.
    pub(crate) fn close(&self) {
        let poller = self.poller.borrow_mut().take();
        let receiver = self.posted.borrow_mut().take();
        if poller.is_none() {
            return;
        }

        let state = std::mem::take(&mut *self.state.borrow_mut());
        drop(receiver);
        drop(poller);
        drop(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactor::overlapped::Outcome;
    use std::io::Write;

    fn port() -> Rc<Port> {
        Rc::new(Port::new(16).unwrap())
    }

    fn write(handle: &Handle, data: &[u8]) {
        handle
            .with_socket(|socket| {
                let mut socket: &socket2::Socket = socket;
                socket.write_all(data)
            })
            .unwrap()
            .unwrap();
    }

    #[test]
    fn ready_request_completes_during_submit() {
        let port = port();
        let (a, b) = Handle::pair().unwrap();
        port.associate(&a).unwrap();
        write(&b, b"hi");

        match port.submit(1, &a, Request::Recv { len: 16 }).unwrap() {
            Submitted::Completed(Ok(Outcome::Received(data))) => assert_eq!(data, b"hi"),
            _ => panic!("expected an immediate completion"),
        }
        assert_eq!(port.inflight_count(), 0);
    }

    #[test]
    fn parked_request_completes_on_readiness() {
        let port = port();
        let (a, b) = Handle::pair().unwrap();
        port.associate(&a).unwrap();

        assert!(matches!(
            port.submit(7, &a, Request::Recv { len: 16 }).unwrap(),
            Submitted::Pending
        ));
        assert!(port.wait(Some(Duration::ZERO)).unwrap().is_none());

        write(&b, b"later");
        let completion = port.wait(Some(Duration::from_secs(5))).unwrap().unwrap();
        assert_eq!(completion.address, 7);
        assert!(matches!(completion.status, Ok(Outcome::Received(ref d)) if d == b"later"));
        assert_eq!(port.inflight_count(), 0);
    }

    #[test]
    fn cancel_still_produces_a_completion() {
        let port = port();
        let (a, _b) = Handle::pair().unwrap();
        port.associate(&a).unwrap();
        port.submit(3, &a, Request::Recv { len: 1 }).unwrap();

        port.cancel(3).unwrap();
        assert!(port.cancel(3).is_err());

        let completion = port.wait(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(completion.address, 3);
        assert!(matches!(completion.status, Err(libc::ECANCELED)));
    }

    #[test]
    fn closing_a_handle_aborts_its_requests() {
        let port = port();
        let (a, _b) = Handle::pair().unwrap();
        port.associate(&a).unwrap();
        port.submit(1, &a, Request::Recv { len: 1 }).unwrap();
        port.submit(2, &a, Request::Recv { len: 1 }).unwrap();

        a.close();
        assert!(!port.is_associated(&a));

        let first = port.wait(Some(Duration::ZERO)).unwrap().unwrap();
        let second = port.wait(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!((first.address, second.address), (1, 2));
        assert!(matches!(second.status, Err(libc::ECANCELED)));
    }

    #[test]
    fn posted_completions_wake_a_blocking_wait() {
        let port = port();
        let poster = port.poster().unwrap();

        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            poster.post(42, Err(libc::ETIMEDOUT))
        });

        let completion = port.wait(None).unwrap().unwrap();
        assert_eq!(completion.address, 42);
        assert!(worker.join().unwrap());
    }

    #[test]
    fn closed_port_rejects_work() {
        let port = port();
        let poster = port.poster().unwrap();
        port.close();
        port.close();

        assert!(port.is_closed());
        assert!(matches!(port.wait(Some(Duration::ZERO)), Err(Error::Closed)));
        assert!(!poster.post(1, Err(libc::ETIMEDOUT)));
    }
}
