//! Process-like handle over a remote command.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::session::{RemoteCommand, Session, Shared};
use super::state::SessionState;
use super::target::Target;
use super::transport::Connector;
use crate::error::ExecError;
use crate::output::{Redirect, StreamBuffer};
use crate::supervisor::{Worker, WorkerBuilder};
use crate::Result;

/// A remote command running on its own supervised worker.
///
/// Mirrors a local child process: poll or wait for the exit code, write to
/// stdin while it runs and read captured output at any time.
pub struct RemoteProcess {
    shared: Arc<Shared>,
    connection: String,
    worker: Option<Worker<i32>>,
    outcome: Option<Result<i32>>,
}

impl RemoteProcess {
    /// Validate the request and start the command.
    pub fn spawn<C: Connector>(
        connector: Arc<C>,
        target: Target,
        command: RemoteCommand,
    ) -> Result<Self> {
        Self::spawn_with(connector, target, command, WorkerBuilder::new())
    }

    /// Start the command on a worker built from `builder`.
    pub fn spawn_with<C: Connector>(
        connector: Arc<C>,
        target: Target,
        command: RemoteCommand,
        builder: WorkerBuilder,
    ) -> Result<Self> {
        let session = Session::new(connector, target, command)?;
        let shared = Arc::clone(session.shared());
        let connection = session.key().to_string();
        let worker = builder
            .name(format!("remote:{connection}"))
            .spawn(move |token| session.run(token))?;
        Ok(Self {
            shared,
            connection,
            worker: Some(worker),
            outcome: None,
        })
    }

    /// The exit code if the command finished, `None` while it runs.
    ///
    /// A failed run returns its error.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        let finished = self
            .worker
            .as_ref()
            .map_or(true, |worker| !worker.is_alive());
        if !finished {
            return Ok(None);
        }
        self.outcome().map(Some)
    }

    /// Wait for the command to finish.
    ///
    /// An explicit `timeout` replaces the execution deadline, counting from
    /// now. It also bounds the connect phase: a worker still connecting when
    /// it expires is aborted and `Timeout` returned.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<i32> {
        if let Some(limit) = timeout {
            self.shared.update_timeout(timeout);
            if self.outcome.is_none() && self.still_connecting_after(limit) {
                debug!(connection = %self.connection, ?limit, "wait expired before the command started");
                self.terminate();
                let timed_out = Err(ExecError::Timeout {
                    command: self.shared.command.clone(),
                    limit: Some(limit),
                    pid: None,
                });
                self.outcome = Some(timed_out.clone());
                return timed_out;
            }
        }
        self.outcome()
    }

    /// Write `input`, close stdin and wait. Returns the captured stdout and
    /// stderr, empty for streams that are not captured.
    pub fn communicate(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        if let Some(input) = input.filter(|i| !i.is_empty()) {
            self.shared.queue_stdin(input)?;
        }
        self.shared.close_stdin();
        self.wait(timeout)?;
        Ok((self.captured(false), self.captured(true)))
    }

    /// Queue bytes for the command's stdin.
    pub fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.shared.queue_stdin(data)
    }

    /// Send EOF once queued input is written.
    pub fn close_stdin(&self) {
        self.shared.close_stdin();
    }

    /// Ask the session to stop at its next loop iteration.
    ///
    /// The worker is marked aborted so the resulting error is not recorded
    /// as a failure.
    pub fn terminate(&self) {
        debug!(connection = %self.connection, "terminating remote command");
        self.shared.request_abort();
        if let Some(worker) = &self.worker {
            worker.abort(Duration::ZERO);
        }
    }

    /// Cancel the worker and wait up to `timeout` for it to end. Returns
    /// whether it ended.
    pub fn abort_worker(&self, timeout: Duration) -> bool {
        self.shared.request_abort();
        self.worker
            .as_ref()
            .map_or(true, |worker| worker.abort(timeout))
    }

    /// Replace the execution timeout, counting from now.
    pub fn update_timeout(&self, timeout: Option<Duration>) {
        self.shared.update_timeout(timeout);
    }

    /// Captured stdout buffer, readable while the command runs.
    pub fn stdout(&self) -> Option<Arc<StreamBuffer>> {
        self.shared.stdout.buffer().cloned()
    }

    /// Captured stderr buffer. Shares the stdout buffer when merged.
    pub fn stderr(&self) -> Option<Arc<StreamBuffer>> {
        self.shared.stderr.buffer().cloned()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.shared.exit_code()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Pool slot the command runs on, as `principal@endpoint(tag)`.
    pub fn connection_name(&self) -> &str {
        &self.connection
    }

    pub fn command(&self) -> &str {
        &self.shared.command
    }

    fn captured(&self, stderr: bool) -> Vec<u8> {
        let out = self.shared.stdout.buffer();
        if !stderr {
            return out.map(|b| b.contents()).unwrap_or_default();
        }
        match (self.shared.stderr.buffer(), out) {
            // A merged stderr has nothing of its own.
            (Some(err), Some(out)) if Arc::ptr_eq(err, out) => Vec::new(),
            (Some(err), _) => err.contents(),
            (None, _) => Vec::new(),
        }
    }

    fn still_connecting_after(&self, limit: Duration) -> bool {
        let Some(worker) = &self.worker else {
            return false;
        };
        !worker.wait_timeout(Some(limit))
            && matches!(self.state(), SessionState::Init | SessionState::Connecting)
    }

    fn outcome(&mut self) -> Result<i32> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let result = match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(Some(code)) => Ok(code),
                Ok(None) => Err(ExecError::Aborted {
                    command: self.shared.command.clone(),
                }),
                Err(e) => Err(e),
            },
            None => Err(ExecError::InvalidArgument("process was never started".into())),
        };
        self.outcome = Some(result.clone());
        result
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            if worker.is_alive() {
                debug!(connection = %self.connection, "remote process dropped while running");
                self.shared.request_abort();
                worker.abort(Duration::ZERO);
            }
        }
    }
}

/// Quote `args` into one shell command line.
pub fn shell_cmd<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote one word for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Run `command` and return its exit code.
pub fn call<C: Connector>(connector: &Arc<C>, target: &Target, command: RemoteCommand) -> Result<i32> {
    let mut process = RemoteProcess::spawn(Arc::clone(connector), target.clone(), command)?;
    process.communicate(None, None)?;
    process.wait(None)
}

/// Run `command`, failing with `NonZeroExit` on a nonzero exit code.
pub fn check_call<C: Connector>(
    connector: &Arc<C>,
    target: &Target,
    command: RemoteCommand,
) -> Result<()> {
    let text = command.command.clone();
    match call(connector, target, command)? {
        0 => Ok(()),
        code => Err(ExecError::NonZeroExit {
            code,
            command: text,
            pid: None,
            output: None,
        }),
    }
}

/// Run `command` and return its stdout.
///
/// Stdout must be left at its default; it is captured here. The error for a
/// nonzero exit carries the captured output.
pub fn check_output<C: Connector>(
    connector: &Arc<C>,
    target: &Target,
    command: RemoteCommand,
) -> Result<Vec<u8>> {
    if command.stdout != Redirect::Inherit {
        return Err(ExecError::InvalidArgument(
            "stdout is captured by check_output".into(),
        ));
    }
    let text = command.command.clone();
    let command = command.stdout(Redirect::Capture);
    let mut process = RemoteProcess::spawn(Arc::clone(connector), target.clone(), command)?;
    let (stdout, _) = process.communicate(None, None)?;
    match process.wait(None)? {
        0 => Ok(stdout),
        code => Err(ExecError::NonZeroExit {
            code,
            command: text,
            pid: None,
            output: Some(stdout),
        }),
    }
}
