//! Remote command session engine.
//!
//! A [`Session`] runs one command on a pooled connection:
//!
//! 1. **Connect**: check out (or create) the pooled connection for the
//!    session's key and open a channel, retrying per the command's connect
//!    limits. A failed attempt releases and evicts the key, then sleeps a
//!    random jitter so workers hitting the same endpoint spread out.
//! 2. **Execute**: issue the command and pump output, queued input and
//!    deadline/abort checks until the remote side reports completion.
//! 3. **Drain**: fetch the exit status, read what is left of both streams
//!    and close the channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use super::pool::{ConnectionKey, Lease};
use super::state::SessionState;
use super::target::{resolve_tag, Target};
use super::transport::{Channel, Connector, StreamRead, Transport};
use crate::error::ExecError;
use crate::output::{OutputSink, Redirect};
use crate::retry::Retry;
use crate::supervisor::CancelToken;
use crate::Result;

/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default overall connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(180);

/// Sleep of the I/O loop when nothing happened in an iteration.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound of the random pause after a failed connect attempt.
pub const CONNECT_JITTER: Duration = Duration::from_secs(2);

/// How long output is still read after the command exited.
pub const DRAIN_WINDOW: Duration = Duration::from_secs(10);

/// Exit code before the command has finished.
pub const EXIT_CODE_UNSET: i32 = -1;

const READ_CHUNK: usize = 32 * 1024;
const DRAIN_PAUSE: Duration = Duration::from_millis(10);

/// A command to run on a remote target.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    /// Shell command line.
    pub command: String,
    /// Variables rendered as inline assignments in front of the command.
    pub env: BTreeMap<String, String>,
    pub stdout: Redirect,
    pub stderr: Redirect,
    /// Execution timeout, `None` for unbounded.
    pub timeout: Option<Duration>,
    /// Overall connect timeout, `None` for unbounded.
    pub connect_timeout: Option<Duration>,
    /// Connect attempts, `None` for unlimited.
    pub max_connect_attempts: Option<u32>,
    /// Pool tag. See [`resolve_tag`].
    pub tag: Option<String>,
    /// Allocate a pseudo-terminal.
    pub pty: bool,
    /// Prefix `source /etc/profile;`. Defaults to on for `root`.
    pub source_profile: Option<bool>,
    /// Keep stdin open after queued input is written.
    pub keep_stdin_open: bool,
    /// Input queued before the command starts.
    pub input: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
            timeout: Some(DEFAULT_TIMEOUT),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_connect_attempts: None,
            tag: None,
            pty: false,
            source_profile: None,
            keep_stdin_open: false,
            input: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Capture stdout and stderr separately.
    pub fn capture(self) -> Self {
        self.stdout(Redirect::Capture).stderr(Redirect::Capture)
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_connect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn source_profile(mut self, source: bool) -> Self {
        self.source_profile = Some(source);
        self
    }

    pub fn keep_stdin_open(mut self, keep: bool) -> Self {
        self.keep_stdin_open = keep;
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Render the command line sent to `target`.
    pub fn render(&self, target: &Target) -> Result<String> {
        let mut line = String::new();
        if self
            .source_profile
            .unwrap_or(target.principal == "root")
        {
            line.push_str("source /etc/profile; ");
        }
        for (key, value) in &self.env {
            let valid_key = key
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_key || value.contains('"') {
                return Err(ExecError::InvalidEnvironment {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
            line.push_str(&format!("{key}=\"{value}\" "));
        }
        line.push_str(&self.command);
        Ok(line)
    }
}

#[derive(Debug, Default)]
struct StdinQueue {
    pending: Vec<u8>,
    written: bool,
    close_requested: bool,
    eof_sent: bool,
}

/// State shared between a session's worker and the handles observing it.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) command: String,
    pub(crate) abort: Arc<AtomicBool>,
    timeout: Mutex<Option<Duration>>,
    deadline: Mutex<Option<Instant>>,
    exit_code: AtomicI32,
    state: Mutex<SessionState>,
    stdin: Mutex<StdinQueue>,
    keep_stdin_open: bool,
    pub(crate) stdout: OutputSink,
    pub(crate) stderr: OutputSink,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    pub(crate) fn state(&self) -> SessionState {
        *relock(&self.state)
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        relock(&self.state).transition_to(next)
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        let code = self.exit_code.load(Ordering::SeqCst);
        (code != EXIT_CODE_UNSET).then_some(code)
    }

    /// Restart the execution clock with the current timeout.
    fn arm_deadline(&self) {
        let timeout = *relock(&self.timeout);
        *relock(&self.deadline) = timeout.map(|t| Instant::now() + t);
    }

    /// Replace the timeout, counting from now.
    pub(crate) fn update_timeout(&self, timeout: Option<Duration>) {
        *relock(&self.timeout) = timeout;
        *relock(&self.deadline) = timeout.map(|t| Instant::now() + t);
    }

    pub(crate) fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn queue_stdin(&self, data: &[u8]) -> Result<()> {
        let mut stdin = relock(&self.stdin);
        if stdin.eof_sent || stdin.close_requested {
            return Err(ExecError::InvalidArgument("stdin is already closed".into()));
        }
        stdin.pending.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn close_stdin(&self) {
        relock(&self.stdin).close_requested = true;
    }
}

/// Open channel plus the pool lease keeping its connection alive.
pub(crate) struct Opened<T: Transport> {
    pub(crate) lease: Lease<T>,
    pub(crate) channel: T::Channel,
}

#[derive(Debug, Default)]
struct Streams {
    stdout_closed: bool,
    stderr_closed: bool,
}

impl Streams {
    fn closed(&self) -> bool {
        self.stdout_closed && self.stderr_closed
    }
}

/// One remote command on one channel.
pub struct Session<C: Connector> {
    connector: Arc<C>,
    target: Target,
    key: ConnectionKey,
    command: RemoteCommand,
    command_line: String,
    shared: Arc<Shared>,
}

impl<C: Connector> Session<C> {
    /// Validate the target and command and resolve the pool key.
    ///
    /// The key's tag is resolved on the calling thread.
    pub fn new(connector: Arc<C>, target: Target, command: RemoteCommand) -> Result<Self> {
        target.validate()?;
        let command_line = command.render(&target)?;
        let key = ConnectionKey::new(
            target.principal.clone(),
            target.endpoint.clone(),
            resolve_tag(command.tag.as_deref()),
        );
        let (stdout, stderr) = OutputSink::resolve(command.stdout, command.stderr)?;
        let shared = Arc::new(Shared {
            command: command.command.clone(),
            abort: Arc::new(AtomicBool::new(false)),
            timeout: Mutex::new(command.timeout),
            deadline: Mutex::new(None),
            exit_code: AtomicI32::new(EXIT_CODE_UNSET),
            state: Mutex::new(SessionState::Init),
            stdin: Mutex::new(StdinQueue {
                pending: command.input.clone().unwrap_or_default(),
                ..StdinQueue::default()
            }),
            keep_stdin_open: command.keep_stdin_open,
            stdout,
            stderr,
        });
        Ok(Self {
            connector,
            target,
            key,
            command,
            command_line,
            shared,
        })
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Rendered command line.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Run the command to completion and return its exit code.
    pub fn run(&self, token: &CancelToken) -> Result<i32> {
        let mut opened = self.open(token, &self.command_line)?;
        let result = self.execute(&mut opened, token);
        self.settle(&mut opened, result)
    }

    /// Connect, then start `command_line` on a fresh channel.
    pub(crate) fn open(
        &self,
        token: &CancelToken,
        command_line: &str,
    ) -> Result<Opened<C::Transport>> {
        let (lease, mut channel) = self.connect(token)?;
        if let Err(e) = self.start(&mut channel, command_line) {
            close_quietly(&mut channel);
            let e = classify(e, &lease, &self.target);
            return Err(self.fail(e));
        }
        self.shared.arm_deadline();
        self.shared.transition(SessionState::Executing)?;
        debug!(key = %self.key, command = %self.shared.command, "command started");
        Ok(Opened { lease, channel })
    }

    /// Close the channel and record the final state of a failed run.
    pub(crate) fn settle<T>(
        &self,
        opened: &mut Opened<C::Transport>,
        result: Result<T>,
    ) -> Result<T> {
        result.map_err(|e| {
            close_quietly(&mut opened.channel);
            let e = classify(e, &opened.lease, &self.target);
            self.fail(e)
        })
    }

    /// Mark the session complete after a caller-driven exchange.
    pub(crate) fn complete(&self, opened: &mut Opened<C::Transport>, code: i32) -> Result<()> {
        self.shared.transition(SessionState::Draining)?;
        self.shared.exit_code.store(code, Ordering::SeqCst);
        close_quietly(&mut opened.channel);
        self.shared.transition(SessionState::Done)
    }

    fn start(&self, channel: &mut <C::Transport as Transport>::Channel, command_line: &str) -> Result<()> {
        if self.command.pty {
            channel.request_pty(&self.target.options.term)?;
        }
        channel.exec(command_line)
    }

    fn connect(
        &self,
        token: &CancelToken,
    ) -> Result<(Lease<C::Transport>, <C::Transport as Transport>::Channel)> {
        self.shared.transition(SessionState::Connecting)?;
        let pool = self.connector.pool();
        let retry = Retry::new()
            .max_attempts(self.command.max_connect_attempts)
            .deadline_after(self.command.connect_timeout)
            .raise_on_exhaustion(false);
        let mut attempts = retry.iter();
        let mut last_reason = None;

        while let Some(attempt) = attempts.next() {
            let attempt = attempt?;
            self.check_abort(token).map_err(|e| self.fail(e))?;

            let opened = pool
                .acquire_or_create(&self.key, || self.connector.connect(&self.target))
                .and_then(|lease| match lease.open_channel() {
                    Ok(channel) => Ok((lease, channel)),
                    Err(e) => Err(classify(e, &lease, &self.target)),
                });
            let error = match opened {
                Ok(pair) => {
                    debug!(key = %self.key, attempt, "connected");
                    return Ok(pair);
                }
                Err(e) => e,
            };

            warn!(key = %self.key, attempt, error = %error, "connect attempt failed");
            last_reason = Some(match error {
                ExecError::ConnectFailure {
                    reason: Some(reason),
                    ..
                } => reason,
                other => other.to_string(),
            });
            // The failed lease is already checked in.
            pool.evict(&self.key);

            if attempts.remaining().map_or(true, |r| !r.is_zero()) {
                let jitter = rand::thread_rng().gen_range(0..CONNECT_JITTER.as_millis() as u64);
                if token.sleep(Duration::from_millis(jitter)).is_err() {
                    return Err(self.fail(self.aborted()));
                }
            }
            self.check_abort(token).map_err(|e| self.fail(e))?;
        }

        Err(self.fail(self.target.connect_failure(last_reason)))
    }

    fn execute(&self, opened: &mut Opened<C::Transport>, token: &CancelToken) -> Result<i32> {
        let channel = &mut opened.channel;
        let mut streams = Streams::default();
        loop {
            let mut busy = self.pump_output(channel, &mut streams)?;
            busy |= self.pump_stdin(channel)?;
            if channel.exit_status_ready()? {
                break;
            }
            self.check_deadline()?;
            self.check_abort(token)?;
            if !busy && token.sleep(POLL_INTERVAL).is_err() {
                return Err(self.aborted());
            }
        }

        self.shared.transition(SessionState::Draining)?;
        let code = channel.exit_status()?;
        self.shared.exit_code.store(code, Ordering::SeqCst);
        if code != 0 {
            if let Some(broken) = opened.lease.last_error().filter(|e| e.is_broken()) {
                return Err(broken.into_exec_error(&self.target));
            }
        }

        self.drain(channel, &mut streams)?;
        close_quietly(channel);
        self.shared.transition(SessionState::Done)?;
        self.log_output(code);
        Ok(code)
    }

    /// Read once from each open stream. Returns whether any bytes arrived.
    fn pump_output(
        &self,
        channel: &mut <C::Transport as Transport>::Channel,
        streams: &mut Streams,
    ) -> Result<bool> {
        let mut busy = false;
        if !streams.stdout_closed {
            match channel.read_stdout(READ_CHUNK)? {
                StreamRead::Data(bytes) => {
                    self.shared.stdout.write(&bytes)?;
                    busy = true;
                }
                StreamRead::Pending => {}
                StreamRead::Closed => streams.stdout_closed = true,
            }
        }
        if !streams.stderr_closed {
            match channel.read_stderr(READ_CHUNK)? {
                StreamRead::Data(bytes) => {
                    self.shared.stderr.write(&bytes)?;
                    busy = true;
                }
                StreamRead::Pending => {}
                StreamRead::Closed => streams.stderr_closed = true,
            }
        }
        Ok(busy)
    }

    /// Write queued input, then send EOF when due.
    fn pump_stdin(&self, channel: &mut <C::Transport as Transport>::Channel) -> Result<bool> {
        let mut stdin = relock(&self.shared.stdin);
        if stdin.eof_sent {
            return Ok(false);
        }
        let mut busy = false;
        if !stdin.pending.is_empty() {
            let written = channel.write_stdin(&stdin.pending)?;
            stdin.pending.drain(..written);
            stdin.written |= written > 0;
            busy = written > 0;
        }
        let eof_due =
            stdin.close_requested || (stdin.written && !self.shared.keep_stdin_open);
        if stdin.pending.is_empty() && eof_due {
            channel.send_eof()?;
            stdin.eof_sent = true;
        }
        Ok(busy)
    }

    fn drain(
        &self,
        channel: &mut <C::Transport as Transport>::Channel,
        streams: &mut Streams,
    ) -> Result<()> {
        let until = Instant::now() + DRAIN_WINDOW;
        while !streams.closed() {
            if Instant::now() > until {
                debug!(key = %self.key, "output still open after drain window");
                break;
            }
            if !self.pump_output(channel, streams)? {
                std::thread::sleep(DRAIN_PAUSE);
            }
        }
        Ok(())
    }

    fn check_deadline(&self) -> Result<()> {
        let expired = relock(&self.shared.deadline).is_some_and(|d| Instant::now() > d);
        if expired {
            return Err(ExecError::Timeout {
                command: self.shared.command.clone(),
                limit: *relock(&self.shared.timeout),
                pid: None,
            });
        }
        Ok(())
    }

    fn check_abort(&self, token: &CancelToken) -> Result<()> {
        if self.shared.abort_requested() || token.is_cancelled() {
            return Err(self.aborted());
        }
        Ok(())
    }

    fn aborted(&self) -> ExecError {
        ExecError::Aborted {
            command: self.shared.command.clone(),
        }
    }

    /// Move to `Failed` or `Aborted` and hand the error back.
    fn fail(&self, error: ExecError) -> ExecError {
        let error = match error {
            ExecError::Cancelled => self.aborted(),
            other => other,
        };
        let next = if error.is_abort() {
            SessionState::Aborted
        } else {
            SessionState::Failed
        };
        let mut state = relock(&self.shared.state);
        if !state.is_terminal() && state.transition_to(next).is_err() {
            let _ = state.transition_to(SessionState::Failed);
        }
        error
    }

    fn log_output(&self, code: i32) {
        debug!(key = %self.key, command = %self.shared.command, code, "command finished");
        if let Some(buffer) = self.shared.stdout.buffer() {
            debug!(key = %self.key, stdout = %buffer.text(), "captured stdout");
        }
        if let (Some(buffer), false) = (self.shared.stderr.buffer(), self.merged()) {
            debug!(key = %self.key, stderr = %buffer.text(), "captured stderr");
        }
    }

    fn merged(&self) -> bool {
        matches!(self.command.stderr, Redirect::Merge)
    }
}

/// Turn transport failures into connect failures when the connection broke.
fn classify<T: Transport>(error: ExecError, lease: &Lease<T>, target: &Target) -> ExecError {
    match &error {
        ExecError::Transport(_) => match lease.last_error() {
            Some(last) if last.is_broken() => last.into_exec_error(target),
            _ => error,
        },
        ExecError::Io(io) => match io.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => target.connect_failure(Some(io.to_string())),
            _ => error,
        },
        _ => error,
    }
}

fn close_quietly<Ch: Channel>(channel: &mut Ch) {
    if let Err(e) = channel.close() {
        debug!(error = %e, "ignoring channel close failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_root_sources_profile() {
        let target = Target::new("db1");
        let line = RemoteCommand::new("uptime").render(&target).unwrap();
        assert_eq!(line, "source /etc/profile; uptime");

        let target = Target::new("db1").principal("deploy");
        let line = RemoteCommand::new("uptime").render(&target).unwrap();
        assert_eq!(line, "uptime");

        let line = RemoteCommand::new("uptime")
            .source_profile(false)
            .render(&Target::new("db1"))
            .unwrap();
        assert_eq!(line, "uptime");
    }

    #[test]
    fn test_render_env_prefix() {
        let target = Target::new("db1").principal("deploy");
        let line = RemoteCommand::new("make install")
            .env("PREFIX", "/opt/app")
            .env("JOBS", "4")
            .render(&target)
            .unwrap();
        assert_eq!(line, "JOBS=\"4\" PREFIX=\"/opt/app\" make install");
    }

    #[test]
    fn test_render_rejects_quote() {
        let err = RemoteCommand::new("true")
            .env("GREETING", "say \"hi\"")
            .render(&Target::new("db1"))
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidEnvironment { ref key, .. } if key == "GREETING"));
    }

    #[test]
    fn test_render_rejects_bad_key() {
        let target = Target::new("db1");
        assert!(RemoteCommand::new("true").env("1X", "v").render(&target).is_err());
        assert!(RemoteCommand::new("true").env("A-B", "v").render(&target).is_err());
    }

    #[test]
    fn test_defaults() {
        let cmd = RemoteCommand::new("ls");
        assert_eq!(cmd.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(cmd.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(cmd.max_connect_attempts, None);
        assert!(!cmd.keep_stdin_open);
    }
}
