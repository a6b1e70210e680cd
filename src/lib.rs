//! # shell-exec
//!
//! Unified local and remote command execution.
//!
//! Commands run either as local child processes or over pooled SSH
//! connections, behind one process-like interface: poll or wait for the
//! exit code, write stdin, read captured output and enforce timeouts.
//!
//! ## Features
//!
//! - **Remote sessions**: connect with retry and jitter, reuse pooled
//!   connections, drain output after exit
//! - **Local processes**: deadlines with signal-then-kill escalation
//! - **Supervised workers**: failures recorded in order and re-raised at join
//! - **File transfer**: SCP push and pull with cooperative abort
//!
//! ## Quick Start
//!
//! ```no_run
//! use shell_exec::remote::{self, ssh, RemoteCommand, Target};
//!
//! fn main() -> shell_exec::Result<()> {
//!     shell_exec::logging::try_init().ok();
//!
//!     let target = Target::new("db1").principal("ops");
//!     let uptime = remote::check_output(&ssh::connector(), &target, RemoteCommand::new("uptime"))?;
//!     println!("{}", String::from_utf8_lossy(&uptime));
//!
//!     ssh::shutdown();
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod output;
pub mod remote;
pub mod retry;
pub mod supervisor;
pub mod transfer;

// Re-export commonly used types
pub use error::{ExecError, Result};
pub use execution::{Command, CommandExecutor, ExecutionResult, Process};
pub use remote::{RemoteCommand, RemoteProcess, Target};
pub use supervisor::{CancelToken, Worker, WorkerBuilder};
