//! Error types for shell-exec.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Main error type for local and remote execution.
///
/// The type is `Clone` so that a failure captured on a worker thread can be
/// stored in the failure record and re-raised at `join` as the same value.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// The endpoint is missing or malformed.
    #[error("invalid target {principal}@{endpoint}: {reason}")]
    InvalidTarget {
        principal: String,
        endpoint: String,
        reason: String,
    },

    /// The connection could not be established or broke while in use.
    #[error("could not connect to {principal}@{endpoint}{}", .reason.as_ref().map(|r| format!(" because {r}")).unwrap_or_default())]
    ConnectFailure {
        principal: String,
        endpoint: String,
        reason: Option<String>,
    },

    /// A retry loop ran past its deadline.
    #[error("{0}")]
    TimeoutExceeded(String),

    /// A retry loop ran out of attempts.
    #[error("{0}")]
    AttemptsExceeded(String),

    /// A command ran past its execution deadline.
    #[error("command '{command}' timed out after {} seconds", .limit.map(|l| l.as_secs_f64()).unwrap_or(0.0))]
    Timeout {
        command: String,
        limit: Option<Duration>,
        pid: Option<u32>,
    },

    /// A command exited with a nonzero status.
    #[error("command '{command}' returned non-zero exit status {code}{}", .output.as_ref().filter(|o| !o.is_empty()).map(|o| format!(": {}", String::from_utf8_lossy(o).trim_end())).unwrap_or_default())]
    NonZeroExit {
        code: i32,
        command: String,
        pid: Option<u32>,
        output: Option<Vec<u8>>,
    },

    /// A command or transfer was aborted by the caller.
    #[error("command '{command}' was aborted")]
    Aborted { command: String },

    /// The file transfer peer violated the protocol or reported an error.
    #[error("transfer protocol error: {0}")]
    ProtocolError(String),

    /// The local destination of a transfer is unusable.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// An environment overlay value cannot be rendered into a remote command.
    #[error("environment variable {key}: value {value:?} cannot contain '\"'")]
    InvalidEnvironment { key: String, value: String },

    /// A caller-supplied argument is inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote session was driven through an invalid state change.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::remote::SessionState,
        to: crate::remote::SessionState,
    },

    /// Transport-level failure that does not indicate a broken connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker observed a cancellation request.
    #[error("worker cancelled")]
    Cancelled,

    /// The worker body panicked.
    #[error("worker {worker} panicked: {message}")]
    Panicked { worker: String, message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl ExecError {
    /// Whether this error ends a command that was deliberately stopped.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::Cancelled)
    }

    /// Captured output attached to the error, if any.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Self::NonZeroExit { output, .. } => output.as_deref(),
            _ => None,
        }
    }
}

/// Convenience Result type for shell-exec operations.
pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_display() {
        let err = ExecError::ConnectFailure {
            principal: "root".into(),
            endpoint: "10.0.0.7".into(),
            reason: Some("connection refused".into()),
        };
        assert_eq!(
            err.to_string(),
            "could not connect to root@10.0.0.7 because connection refused"
        );

        let err = ExecError::ConnectFailure {
            principal: "root".into(),
            endpoint: "10.0.0.7".into(),
            reason: None,
        };
        assert_eq!(err.to_string(), "could not connect to root@10.0.0.7");
    }

    #[test]
    fn test_non_zero_exit_display() {
        let err = ExecError::NonZeroExit {
            code: 2,
            command: "ls /nope".into(),
            pid: Some(42),
            output: Some(b"no such file\n".to_vec()),
        };
        let text = err.to_string();
        assert!(text.contains("non-zero exit status 2"));
        assert!(text.ends_with(": no such file"));
        assert_eq!(err.output(), Some(&b"no such file\n"[..]));
    }

    #[test]
    fn test_timeout_display() {
        let err = ExecError::Timeout {
            command: "sleep 10".into(),
            limit: Some(Duration::from_secs(3)),
            pid: None,
        };
        assert!(err.to_string().contains("timed out after 3 seconds"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ExecError = io_err.into();
        assert!(matches!(err, ExecError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
        // Clones share the underlying io::Error.
        let copy = err.clone();
        if let (ExecError::Io(a), ExecError::Io(b)) = (&err, &copy) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn test_is_abort() {
        assert!(ExecError::Aborted {
            command: "x".into()
        }
        .is_abort());
        assert!(ExecError::Cancelled.is_abort());
        assert!(!ExecError::ProtocolError("bad".into()).is_abort());
    }
}
