use std::io;

use thiserror::Error;

/// The single error taxonomy shared by every layer of the host. Wrapper
/// layers propagate these unchanged; there are no partial successes.
#[derive(Debug, Error)]
pub enum HostError {
    /// The underlying device or socket failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A polled completion did not arrive in time.
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    /// An operation was attempted before `connect()` (or after the
    /// transport was torn down).
    #[error("not connected to a design")]
    NotConnected,
    /// The peer misbehaved on the wire. Fatal for the current operation,
    /// not necessarily for the session.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A DPI dispatch could not be completed.
    #[error("DPI error: {0}")]
    DpiError(String),
    /// The peer terminated the session. Short-circuits all loops and
    /// triggers clean teardown.
    #[error("peer shut down")]
    Shutdown,
    /// A signal arrived at a message boundary. Only meaningful at
    /// `wait_irq`; framed I/O retries instead.
    #[error("interrupted")]
    Interrupted,
    #[error("not supported by this transport")]
    NotSupported,
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    /// Classify an I/O error from the peer connection. A vanished peer
    /// (broken pipe, reset, EOF) unifies with an explicit shutdown frame;
    /// everything else is a transport fault.
    pub fn from_peer_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => HostError::Shutdown,
            _ => HostError::Transport(err.to_string()),
        }
    }
}
