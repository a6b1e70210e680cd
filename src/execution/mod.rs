//! Local command execution and the local/remote dispatch facade.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use shell_exec::execution::{self, Command, Process};
//! use shell_exec::output::Redirect;
//!
//! # fn main() -> shell_exec::Result<()> {
//! // One-shot helpers
//! let listing = execution::check_output(&Command::argv(["ls", "-l"]))?;
//!
//! // Full control
//! let mut process = Process::spawn(
//!     &Command::new("make test")
//!         .stdout(Redirect::Capture)
//!         .stderr(Redirect::Merge)
//!         .timeout(Some(Duration::from_secs(600))),
//! )?;
//! let (output, _) = process.communicate(None, None)?;
//! # let _ = (listing, output);
//! # Ok(())
//! # }
//! ```

mod command;
mod executor;
mod process;
mod result;

pub use command::{Command, Program, DEFAULT_GRACE, DEFAULT_SIGNAL, DEFAULT_TIMEOUT};
pub use executor::{execute_simple, execute_with_timeout, Backend, CommandExecutor};
pub use process::{call, check_call, check_output, Process, ProcessSnapshot, SnapshotLock};
pub use result::ExecutionResult;
