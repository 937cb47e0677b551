//! Operation requests and their outcomes.
//!
//! An overlapped request is performed by the port on behalf of the caller:
//! right away at submission when the descriptor is ready, or later when the
//! poller reports readiness. Either way the result is a [`Status`]: the
//! [`Outcome`] on success, the raw errno on failure.

use socket2::{SockAddr, Socket};

use std::io::{self, Read, Write};

/// Result of a finished operation: the outcome, or an errno.
pub(crate) type Status = Result<Outcome, i32>;

pub(crate) enum Outcome {
    Received(Vec<u8>),
    Sent(usize),
    Accepted(Socket, SockAddr),
    Connected,
    /// Client end of a pipe, produced by a connect worker thread.
    PipeConnected(Socket),
}

/// Which readiness an in-flight request waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

pub(crate) enum Request {
    Recv { len: usize },
    Send { buf: Vec<u8> },
    Accept,
    Connect { address: SockAddr, started: bool },
}

pub(crate) enum Attempt {
    Done(Status),
    WouldBlock,
}

impl Request {
    pub(crate) fn direction(&self) -> Direction {
        match self {
            Request::Recv { .. } | Request::Accept => Direction::Read,
            Request::Send { .. } | Request::Connect { .. } => Direction::Write,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Request::Recv { .. } => "recv",
            Request::Send { .. } => "send",
            Request::Accept => "accept",
            Request::Connect { .. } => "connect",
        }
    }

    /// Performs the request once on a non-blocking socket.
    pub(crate) fn attempt(&mut self, socket: &Socket) -> Attempt {
        loop {
            let result = match self {
                Request::Recv { len } => {
                    let mut buf = vec![0u8; *len];
                    (&*socket).read(&mut buf).map(|n| {
                        buf.truncate(n);
                        Outcome::Received(buf)
                    })
                }
                Request::Send { buf } => (&*socket).write(buf).map(Outcome::Sent),
                Request::Accept => socket.accept().and_then(|(accepted, peer)| {
                    accepted.set_nonblocking(true)?;
                    Ok(Outcome::Accepted(accepted, peer))
                }),
                Request::Connect { address, started } => {
                    if *started {
                        match socket.take_error() {
                            Ok(None) => Ok(Outcome::Connected),
                            Ok(Some(error)) => Err(error),
                            Err(error) => Err(error),
                        }
                    } else {
                        *started = true;
                        match socket.connect(address) {
                            Ok(()) => Ok(Outcome::Connected),
                            Err(error) if in_progress(&error) => return Attempt::WouldBlock,
                            Err(error) => {
                                return Attempt::Done(Err(crate::error::errno(&error)));
                            }
                        }
                    }
                }
            };

            return match result {
                Ok(outcome) => Attempt::Done(Ok(outcome)),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => Attempt::WouldBlock,
                Err(error) => Attempt::Done(Err(crate::error::errno(&error))),
            };
        }
    }
}

/// Whether a failed `connect` keeps going in the background. An interrupted
/// connect does too.
fn in_progress(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EINTR)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Type};

    fn pair() -> (Socket, Socket) {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn recv_would_block_until_data_arrives() {
        let (a, b) = pair();
        let mut request = Request::Recv { len: 8 };

        assert!(matches!(request.attempt(&a), Attempt::WouldBlock));

        (&b).write_all(b"abc").unwrap();
        match request.attempt(&a) {
            Attempt::Done(Ok(Outcome::Received(data))) => assert_eq!(data, b"abc"),
            _ => panic!("expected received data"),
        }
    }

    #[test]
    fn send_reports_bytes_written() {
        let (a, _b) = pair();
        let mut request = Request::Send {
            buf: b"hello".to_vec(),
        };

        assert!(matches!(request.attempt(&a), Attempt::Done(Ok(Outcome::Sent(5)))));
        assert_eq!(request.direction(), Direction::Write);
    }

    #[test]
    fn send_to_a_closed_peer_fails_with_errno() {
        let (a, b) = pair();
        drop(b);
        let mut request = Request::Send { buf: vec![1] };

        assert!(matches!(request.attempt(&a), Attempt::Done(Err(libc::EPIPE))));
    }

    #[test]
    fn connect_to_a_full_backlog_fails_instead_of_parking() {
        let dir = tempfile::tempdir().unwrap();
        let address = SockAddr::unix(dir.path().join("full")).unwrap();
        let listener = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
        listener.bind(&address).unwrap();
        listener.listen(0).unwrap();

        let mut queued = Vec::new();
        loop {
            let client = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
            client.set_nonblocking(true).unwrap();
            match client.connect(&address) {
                Ok(()) => queued.push(client),
                Err(error) if error.raw_os_error() == Some(libc::EAGAIN) => break,
                Err(error) => panic!("unexpected connect error: {error}"),
            }
            assert!(queued.len() < 64, "backlog never filled up");
        }

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).unwrap();
        socket.set_nonblocking(true).unwrap();
        let mut request = Request::Connect {
            address,
            started: false,
        };

        assert!(matches!(request.attempt(&socket), Attempt::Done(Err(libc::EAGAIN))));
    }
}
