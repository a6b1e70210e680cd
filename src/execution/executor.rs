//! Local/remote dispatch facade.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::command::{Command, Program};
use super::process::Process;
use super::result::ExecutionResult;
use crate::error::ExecError;
use crate::output::{Redirect, StreamBuffer};
use crate::remote::ssh::SshConnector;
use crate::remote::{shell_quote, Connector, RemoteCommand, RemoteProcess, Target};
use crate::Result;

/// Where commands run.
pub enum Backend<C: Connector = SshConnector> {
    /// Child processes of this process.
    Local,
    /// Commands on `target`, connected through `connector`.
    Remote { connector: Arc<C>, target: Target },
}

impl<C: Connector> Clone for Backend<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Local => Self::Local,
            Self::Remote { connector, target } => Self::Remote {
                connector: Arc::clone(connector),
                target: target.clone(),
            },
        }
    }
}

/// Runs [`Command`]s on a [`Backend`] and collects their output.
///
/// Output streams left at `Inherit` are captured. A command that runs
/// past its timeout yields a result with `timed_out` set rather than an
/// error.
pub struct CommandExecutor<C: Connector = SshConnector> {
    backend: Backend<C>,
}

impl<C: Connector> Clone for CommandExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl CommandExecutor {
    /// Executor for local processes.
    pub fn local() -> Self {
        Self {
            backend: Backend::Local,
        }
    }
}

impl<C: Connector> CommandExecutor<C> {
    pub fn new(backend: Backend<C>) -> Self {
        Self { backend }
    }

    /// Executor for commands on `target`.
    pub fn remote(connector: Arc<C>, target: Target) -> Self {
        Self::new(Backend::Remote { connector, target })
    }

    pub fn backend(&self) -> &Backend<C> {
        &self.backend
    }

    /// Execute a command synchronously (blocking).
    pub fn execute_sync(&self, command: &Command, input: Option<&[u8]>) -> Result<ExecutionResult> {
        let command = captured(command, input.is_some());
        match &self.backend {
            Backend::Local => run_local(&command, input),
            Backend::Remote { connector, target } => run_remote(connector, target, &command, input),
        }
    }

    /// Execute a command on the blocking thread pool.
    pub async fn execute_async(
        &self,
        command: Command,
        input: Option<Vec<u8>>,
    ) -> Result<ExecutionResult> {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.execute_sync(&command, input.as_deref()))
            .await
            .map_err(|e| ExecError::Panicked {
                worker: "executor".into(),
                message: e.to_string(),
            })?
    }
}

/// Capture whatever the caller left inherited.
fn captured(command: &Command, with_input: bool) -> Command {
    let mut command = command.clone();
    if command.stdout == Redirect::Inherit {
        command.stdout = Redirect::Capture;
    }
    if command.stderr == Redirect::Inherit {
        command.stderr = Redirect::Capture;
    }
    if with_input {
        command.stdin = Redirect::Capture;
    }
    command
}

fn contents(buffer: Option<Arc<StreamBuffer>>) -> Vec<u8> {
    buffer.map(|b| b.contents()).unwrap_or_default()
}

fn run_local(command: &Command, input: Option<&[u8]>) -> Result<ExecutionResult> {
    let start = Instant::now();
    let mut process = Process::spawn(command)?;
    match process.communicate(input, None) {
        Ok((stdout, stderr)) => {
            let code = process.wait(None)?;
            Ok(ExecutionResult::new(stdout, stderr, code, start.elapsed()))
        }
        Err(ExecError::Timeout { .. }) => {
            debug!(pid = process.pid(), "local command timed out");
            Ok(timed_out(
                process.stdout(),
                process.stderr(),
                command.stderr == Redirect::Merge,
                start.elapsed(),
            ))
        }
        Err(e) => Err(e),
    }
}

fn run_remote<C: Connector>(
    connector: &Arc<C>,
    target: &Target,
    command: &Command,
    input: Option<&[u8]>,
) -> Result<ExecutionResult> {
    let start = Instant::now();
    let mut process = RemoteProcess::spawn(
        Arc::clone(connector),
        target.clone(),
        remote_command(command),
    )?;
    match process.communicate(input, None) {
        Ok((stdout, stderr)) => {
            let code = process.wait(None)?;
            Ok(ExecutionResult::new(stdout, stderr, code, start.elapsed()))
        }
        Err(ExecError::Timeout { .. }) => {
            debug!(connection = %process.connection_name(), "remote command timed out");
            Ok(timed_out(
                process.stdout(),
                process.stderr(),
                command.stderr == Redirect::Merge,
                start.elapsed(),
            ))
        }
        Err(e) => Err(e),
    }
}

fn timed_out(
    stdout: Option<Arc<StreamBuffer>>,
    stderr: Option<Arc<StreamBuffer>>,
    merged: bool,
    elapsed: Duration,
) -> ExecutionResult {
    let stderr = if merged { Vec::new() } else { contents(stderr) };
    ExecutionResult::timeout(contents(stdout), stderr, elapsed)
}

/// Translate a local command for a remote shell. Signal and grace have no
/// remote counterpart.
fn remote_command(command: &Command) -> RemoteCommand {
    let mut line = String::new();
    if let Some(dir) = &command.working_dir {
        line.push_str(&format!("cd {} && ", shell_quote(&dir.to_string_lossy())));
    }
    match &command.program {
        Program::Shell(text) => line.push_str(text),
        Program::Argv(_) => line.push_str(&command.to_string()),
    }
    RemoteCommand::new(line)
        .envs(command.env.clone())
        .stdout(command.stdout)
        .stderr(command.stderr)
        .timeout(command.timeout)
}

/// Simple one-shot local command execution.
pub fn execute_simple(command_line: &str) -> Result<ExecutionResult> {
    CommandExecutor::local().execute_sync(&Command::new(command_line), None)
}

/// Execute a local command with timeout.
pub fn execute_with_timeout(command_line: &str, timeout: Duration) -> Result<ExecutionResult> {
    let cmd = Command::new(command_line).timeout(Some(timeout));
    CommandExecutor::local().execute_sync(&cmd, None)
}
