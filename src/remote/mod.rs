//! Remote command execution over pooled connections.
//!
//! A [`Session`] runs one command on one channel of a pooled connection,
//! reproducing local process semantics: stdin, stdout, stderr, exit status,
//! timeout and cancellation. [`RemoteProcess`] wraps a session in a
//! supervised worker and gives it a process-like handle.
//!
//! Transports plug in through [`Connector`]; [`ssh`] talks to real hosts and
//! [`loopback`] runs commands on this machine.
//!
//! ```no_run
//! use shell_exec::remote::{self, ssh, RemoteCommand, Target};
//!
//! # fn main() -> shell_exec::Result<()> {
//! let target = Target::new("db1").principal("deploy");
//! let uptime = remote::check_output(&ssh::connector(), &target, RemoteCommand::new("uptime"))?;
//! print!("{}", String::from_utf8_lossy(&uptime));
//! # Ok(())
//! # }
//! ```

pub mod loopback;
mod pool;
mod process;
mod session;
pub mod ssh;
mod state;
mod target;
mod transport;

pub use pool::{ConnectionKey, ConnectionPool, Lease};
pub use process::{call, check_call, check_output, shell_cmd, shell_quote, RemoteProcess};
pub use session::{
    RemoteCommand, Session, CONNECT_JITTER, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT,
    DRAIN_WINDOW, EXIT_CODE_UNSET, POLL_INTERVAL,
};
pub use state::SessionState;
pub use target::{
    global_connection_tag, resolve_tag, set_global_connection_tag, Credential, Target,
    TransportOptions, DEFAULT_PORT, DEFAULT_PRINCIPAL, DEFAULT_TERM,
};
pub use transport::{Channel, Connector, StreamRead, Transport, TransportError, TransportErrorKind};
