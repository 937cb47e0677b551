//! Error kinds reported by the proactor, futures and the event loop.
//!
//! Completion-time OS errors are translated into a small set of domain kinds
//! before they reach a [`Future`](crate::Future). Everything that is not
//! abort-class or refused keeps its original errno in [`Error::Os`].

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The peer or the local side aborted the connection, or the operation was
    /// aborted because its handle was closed.
    #[error("connection reset (os error {code})")]
    ConnectionReset { code: i32 },

    /// Nobody accepted the connection within the wait window.
    #[error("connection refused (os error {code})")]
    ConnectionRefused { code: i32 },

    #[error("{message} (os error {code})")]
    Os { code: i32, message: String },

    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("operation was cancelled")]
    Cancelled,

    /// A core invariant was violated, e.g. a Future resolved twice.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(&'static str),

    #[error("proactor is closed")]
    Closed,

    #[error("no event loop attached to the proactor")]
    LoopNotSet,
}

impl Error {
    /// Returns the errno carried by OS-derived kinds.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::ConnectionReset { code }
            | Error::ConnectionRefused { code }
            | Error::Os { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        match error.raw_os_error() {
            Some(code) => from_os(code),
            None => Error::Io {
                kind: error.kind(),
                message: error.to_string(),
            },
        }
    }
}

/// Translates an errno delivered with a completion.
pub(crate) fn from_os(code: i32) -> Error {
    match code {
        libc::ECANCELED | libc::ECONNABORTED | libc::ECONNRESET | libc::EPIPE => {
            Error::ConnectionReset { code }
        }
        libc::ECONNREFUSED => Error::ConnectionRefused { code },
        _ => Error::Os {
            code,
            message: io::Error::from_raw_os_error(code).to_string(),
        },
    }
}

/// Translates the status posted by a pipe connect attempt. An expired wait
/// window is a refusal, not a generic failure.
pub(crate) fn from_pipe_connect(code: i32) -> Error {
    match code {
        libc::ETIMEDOUT => Error::ConnectionRefused { code },
        _ => from_os(code),
    }
}

/// Extracts the errno of a failed syscall, defaulting to `EIO` for errors
/// that did not come from the OS.
pub(crate) fn errno(error: &io::Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_class_codes_become_reset() {
        for code in [libc::ECANCELED, libc::ECONNABORTED, libc::ECONNRESET, libc::EPIPE] {
            assert_eq!(from_os(code), Error::ConnectionReset { code });
        }
    }

    #[test]
    fn pipe_connect_timeout_becomes_refused() {
        assert_eq!(
            from_pipe_connect(libc::ETIMEDOUT),
            Error::ConnectionRefused {
                code: libc::ETIMEDOUT
            }
        );
        // Outside pipe connects a timeout stays a generic OS error.
        assert!(matches!(from_os(libc::ETIMEDOUT), Error::Os { code, .. } if code == libc::ETIMEDOUT));
    }

    #[test]
    fn other_codes_keep_their_errno() {
        let error = Error::from(io::Error::from_raw_os_error(libc::EBADF));
        assert_eq!(error.os_code(), Some(libc::EBADF));
        assert!(matches!(error, Error::Os { .. }));
    }

    #[test]
    fn non_os_io_errors_keep_their_kind() {
        let error = Error::from(io::Error::new(io::ErrorKind::InvalidInput, "bad path"));
        assert!(matches!(error, Error::Io { kind: io::ErrorKind::InvalidInput, .. }));
        assert_eq!(error.os_code(), None);
    }
}
