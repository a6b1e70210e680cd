//! SSH transport backed by libssh2.
//!
//! Sessions are authenticated in blocking mode, then switched to
//! non-blocking so several channels can share one connection from
//! different worker threads. Calls that must complete (opening a channel,
//! exec, EOF, close) are retried while libssh2 reports `EAGAIN`.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use ssh2::ErrorCode;
use tracing::debug;

use super::pool::ConnectionPool;
use super::target::{Credential, Target};
use super::transport::{Channel, Connector, StreamRead, Transport, TransportError};
use crate::error::ExecError;
use crate::Result;

const LIBSSH2_ERROR_SOCKET_NONE: i32 = -1;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// TCP connect timeout per resolved address.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// libssh2 timeout while handshaking and authenticating.
const HANDSHAKE_TIMEOUT_MS: u32 = 60_000;

/// Bound on retrying a non-blocking call that keeps returning `EAGAIN`.
const BLOCKING_CALL_LIMIT: Duration = Duration::from_secs(60);

const EAGAIN_PAUSE: Duration = Duration::from_millis(5);

static POOL: OnceLock<ConnectionPool<SshTransport>> = OnceLock::new();
static CONNECTOR: OnceLock<Arc<SshConnector>> = OnceLock::new();

fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn classify(err: &ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_NONE
            | LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_DISCONNECT
            | LIBSSH2_ERROR_SOCKET_TIMEOUT
            | LIBSSH2_ERROR_SOCKET_RECV,
        ) => TransportError::broken(err.message()),
        _ => TransportError::other(err.message()),
    }
}

/// Retry `op` while it reports `EAGAIN`.
fn until_ready<T>(
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> std::result::Result<T, ssh2::Error> {
    let until = Instant::now() + BLOCKING_CALL_LIMIT;
    loop {
        match op() {
            Err(e) if is_eagain(&e) && Instant::now() < until => std::thread::sleep(EAGAIN_PAUSE),
            other => return other,
        }
    }
}

type ErrorSlot = Arc<Mutex<Option<TransportError>>>;

fn record(slot: &ErrorSlot, err: &ssh2::Error) -> ExecError {
    let classified = classify(err);
    let message = classified.message.clone();
    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(classified);
    ExecError::Transport(message)
}

/// Connects targets over SSH. All instances share one process-wide pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

/// The shared SSH connector.
pub fn connector() -> Arc<SshConnector> {
    Arc::clone(CONNECTOR.get_or_init(|| Arc::new(SshConnector)))
}

/// Close every pooled SSH connection.
pub fn shutdown() {
    if let Some(pool) = POOL.get() {
        pool.clear();
    }
}

impl SshConnector {
    fn open_socket(target: &Target) -> io::Result<TcpStream> {
        let mut last = None;
        for addr in target.address().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, SOCKET_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no addresses")
        }))
    }

    fn authenticate(session: &ssh2::Session, target: &Target) -> std::result::Result<(), ssh2::Error> {
        let user = target.principal.as_str();
        match &target.credential {
            Credential::Agent => session.userauth_agent(user),
            Credential::Password(password) => session.userauth_password(user, password),
            Credential::KeyFile { path, passphrase } => {
                session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
            }
        }
    }
}

impl Connector for SshConnector {
    type Transport = SshTransport;

    fn connect(&self, target: &Target) -> Result<SshTransport> {
        let failure = |reason: String| target.connect_failure(Some(reason));

        let socket = Self::open_socket(target).map_err(|e| failure(e.to_string()))?;
        let mut session = ssh2::Session::new().map_err(|e| failure(e.to_string()))?;
        session.set_tcp_stream(socket);
        session.set_timeout(HANDSHAKE_TIMEOUT_MS);
        session.handshake().map_err(|e| failure(e.to_string()))?;
        Self::authenticate(&session, target).map_err(|e| failure(e.to_string()))?;
        if !session.authenticated() {
            return Err(failure("authentication failed".into()));
        }

        if let Some(interval) = target.options.keepalive {
            session.set_keepalive(true, interval.as_secs().max(1) as u32);
        }
        session.set_timeout(0);
        session.set_blocking(false);

        debug!(principal = %target.principal, endpoint = %target.endpoint, "ssh session established");
        Ok(SshTransport {
            session,
            errors: Arc::new(Mutex::new(None)),
        })
    }

    fn pool(&self) -> &ConnectionPool<SshTransport> {
        POOL.get_or_init(ConnectionPool::new)
    }
}

/// One authenticated SSH connection.
pub struct SshTransport {
    session: ssh2::Session,
    errors: ErrorSlot,
}

impl Transport for SshTransport {
    type Channel = SshChannel;

    fn open_channel(&self) -> Result<SshChannel> {
        let channel =
            until_ready(|| self.session.channel_session()).map_err(|e| record(&self.errors, &e))?;
        Ok(SshChannel {
            channel,
            errors: Arc::clone(&self.errors),
        })
    }

    fn close(&self) -> Result<()> {
        until_ready(|| self.session.disconnect(None, "closing", None))
            .map_err(|e| ExecError::Transport(e.message().to_string()))
    }

    fn last_error(&self) -> Option<TransportError> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// One command channel on an [`SshTransport`].
pub struct SshChannel {
    channel: ssh2::Channel,
    errors: ErrorSlot,
}

impl SshChannel {
    fn read_from(&mut self, stderr: bool, max: usize) -> Result<StreamRead> {
        let mut buf = vec![0u8; max];
        let read = if stderr {
            self.channel.stderr().read(&mut buf)
        } else {
            self.channel.read(&mut buf)
        };
        match read {
            Ok(0) | Err(_) if self.channel.eof() => Ok(StreamRead::Closed),
            Ok(0) => Ok(StreamRead::Pending),
            Ok(n) => {
                buf.truncate(n);
                Ok(StreamRead::Data(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(StreamRead::Pending),
            Err(e) => Err(self.io_failure(e)),
        }
    }

    fn io_failure(&self, err: io::Error) -> ExecError {
        let classified = TransportError::broken(err.to_string());
        *self
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(classified);
        ExecError::Transport(err.to_string())
    }
}

impl Channel for SshChannel {
    fn request_pty(&mut self, term: &str) -> Result<()> {
        let channel = &mut self.channel;
        until_ready(|| channel.request_pty(term, None, None)).map_err(|e| record(&self.errors, &e))
    }

    fn exec(&mut self, command: &str) -> Result<()> {
        let channel = &mut self.channel;
        until_ready(|| channel.exec(command)).map_err(|e| record(&self.errors, &e))
    }

    fn read_stdout(&mut self, max: usize) -> Result<StreamRead> {
        self.read_from(false, max)
    }

    fn read_stderr(&mut self, max: usize) -> Result<StreamRead> {
        self.read_from(true, max)
    }

    fn write_stdin(&mut self, data: &[u8]) -> Result<usize> {
        match self.channel.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(self.io_failure(e)),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        let channel = &mut self.channel;
        until_ready(|| channel.send_eof()).map_err(|e| record(&self.errors, &e))
    }

    fn exit_status_ready(&mut self) -> Result<bool> {
        // Output can end long before the command does. The status arrives
        // just before the peer closes the channel, so poll for the close.
        if !self.channel.eof() {
            return Ok(false);
        }
        match self.channel.wait_close() {
            Ok(()) => Ok(true),
            Err(e) if is_eagain(&e) => Ok(false),
            Err(e) => Err(record(&self.errors, &e)),
        }
    }

    fn exit_status(&mut self) -> Result<i32> {
        let channel = &mut self.channel;
        until_ready(|| channel.wait_close()).map_err(|e| record(&self.errors, &e))?;
        self.channel
            .exit_status()
            .map_err(|e| record(&self.errors, &e))
    }

    fn close(&mut self) -> Result<()> {
        let channel = &mut self.channel;
        until_ready(|| channel.close()).map_err(|e| record(&self.errors, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_endpoint_is_connect_failure() {
        // Port 1 on localhost is closed on any sane test machine.
        let target = Target::new("127.0.0.1").port(1);
        let err = SshConnector.connect(&target).err().unwrap();
        assert!(matches!(err, ExecError::ConnectFailure { reason: Some(_), .. }));
    }

    #[test]
    fn test_connector_is_shared() {
        let a = connector();
        let b = connector();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(std::ptr::eq(a.pool(), b.pool()));
    }
}
