//! Capability traits a remote transport must provide.
//!
//! The session engine never talks to a protocol library directly. It drives
//! a [`Connector`] to build [`Transport`]s, which are cached in the
//! connector's [`ConnectionPool`], and opens one [`Channel`] per command.

use std::fmt;

use super::pool::ConnectionPool;
use super::target::Target;
use crate::error::ExecError;
use crate::Result;

/// Outcome of a non-blocking stream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    /// Bytes were available.
    Data(Vec<u8>),
    /// Nothing available right now.
    Pending,
    /// The stream reached end-of-file.
    Closed,
}

/// Classification of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection is gone and must be re-established.
    Broken,
    /// Anything else.
    Other,
}

/// A failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn broken(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Broken,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.kind == TransportErrorKind::Broken
    }

    /// Reclassify into the crate error for `target`.
    pub fn into_exec_error(self, target: &Target) -> ExecError {
        match self.kind {
            TransportErrorKind::Broken => target.connect_failure(Some(self.message)),
            TransportErrorKind::Other => ExecError::Transport(self.message),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One command stream multiplexed over a connection.
///
/// Reads and writes never block for long: an implementation returns
/// [`StreamRead::Pending`] or a zero write count when the peer is not ready.
pub trait Channel: Send {
    /// Allocate a pseudo-terminal of type `term`.
    fn request_pty(&mut self, term: &str) -> Result<()>;

    /// Start `command` on the remote side.
    fn exec(&mut self, command: &str) -> Result<()>;

    fn read_stdout(&mut self, max: usize) -> Result<StreamRead>;

    fn read_stderr(&mut self, max: usize) -> Result<StreamRead>;

    /// Write as much of `data` as the peer accepts. Returns the count.
    fn write_stdin(&mut self, data: &[u8]) -> Result<usize>;

    /// Signal end of input.
    fn send_eof(&mut self) -> Result<()>;

    /// Whether the remote command has exited and its status arrived.
    /// Closed output alone does not count.
    fn exit_status_ready(&mut self) -> Result<bool>;

    /// The remote command's exit status. Only meaningful once ready.
    fn exit_status(&mut self) -> Result<i32>;

    fn close(&mut self) -> Result<()>;
}

/// A live connection able to open channels.
pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;

    fn open_channel(&self) -> Result<Self::Channel>;

    /// Tear the connection down.
    fn close(&self) -> Result<()>;

    /// The most recent transport-level failure, if the transport tracks one.
    fn last_error(&self) -> Option<TransportError> {
        None
    }
}

/// Builds transports for targets and owns the pool they live in.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Establish and authenticate a new connection.
    fn connect(&self, target: &Target) -> Result<Self::Transport>;

    /// Pool the connections are cached in.
    fn pool(&self) -> &ConnectionPool<Self::Transport>;
}
