//! File transfer over a remote session (SCP).
//!
//! A [`Transfer`] acquires a pooled connection the same way a remote
//! command does, starts the peer's `scp` in sink (`-t`) or source (`-f`)
//! mode and drives the matching engine over the channel. The abort flag is
//! shared with the session and checked between chunks.
//!
//! ```no_run
//! use shell_exec::remote::{ssh, Target};
//! use shell_exec::transfer::{self, TransferOptions};
//!
//! # fn main() -> shell_exec::Result<()> {
//! let target = Target::new("build01").principal("deploy");
//! let bytes = transfer::put(
//!     &ssh::connector(),
//!     &target,
//!     &["dist/app.tar.gz"],
//!     "/srv/releases/",
//!     TransferOptions::default(),
//! )?;
//! println!("sent {bytes} bytes");
//! # Ok(())
//! # }
//! ```

mod protocol;
mod stream;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

pub use protocol::{Sink, Source, CHUNK_SIZE};
pub use stream::{ByteStream, ChannelStream};

use crate::error::ExecError;
use crate::remote::{shell_quote, Connector, RemoteCommand, Session, Target};
use crate::supervisor::{CancelToken, Worker, WorkerBuilder};
use crate::Result;

/// Which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local sources to the remote destination.
    Push,
    /// Remote sources to the local destination.
    Pull,
}

/// Progress and cancellation state of one transfer.
#[derive(Debug)]
pub struct TransferState {
    pub direction: Direction,
    pub sources: Vec<String>,
    pub destination: String,
    bytes: AtomicU64,
    abort: Arc<AtomicBool>,
}

impl TransferState {
    pub fn new(direction: Direction, sources: Vec<String>, destination: String) -> Self {
        Self::with_abort_flag(direction, sources, destination, Arc::new(AtomicBool::new(false)))
    }

    fn with_abort_flag(
        direction: Direction,
        sources: Vec<String>,
        destination: String,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            direction,
            sources,
            destination,
            bytes: AtomicU64::new(0),
            abort,
        }
    }

    /// Payload bytes moved so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn check_abort(&self) -> Result<()> {
        if self.abort_requested() {
            Err(self.aborted())
        } else {
            Ok(())
        }
    }

    pub(crate) fn aborted(&self) -> ExecError {
        ExecError::Aborted {
            command: self.label(),
        }
    }

    /// Human-readable description, e.g. `put a.txt -> /tmp`.
    pub fn label(&self) -> String {
        let verb = match self.direction {
            Direction::Push => "put",
            Direction::Pull => "get",
        };
        format!("{verb} {} -> {}", self.sources.join(" "), self.destination)
    }
}

/// Transfer flags and connection settings.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Copy directory trees.
    pub recursive: bool,
    /// Carry modification and access times across.
    pub preserve_times: bool,
    pub connect_timeout: Option<Duration>,
    pub max_connect_attempts: Option<u32>,
    pub tag: Option<String>,
}

impl TransferOptions {
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn preserve_times(mut self, preserve: bool) -> Self {
        self.preserve_times = preserve;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// What to transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: Direction,
    pub sources: Vec<String>,
    pub destination: String,
    pub options: TransferOptions,
}

impl TransferRequest {
    pub fn push<S: AsRef<str>>(sources: &[S], destination: impl Into<String>) -> Self {
        Self::new(Direction::Push, sources, destination)
    }

    pub fn pull<S: AsRef<str>>(sources: &[S], destination: impl Into<String>) -> Self {
        Self::new(Direction::Pull, sources, destination)
    }

    fn new<S: AsRef<str>>(direction: Direction, sources: &[S], destination: impl Into<String>) -> Self {
        Self {
            direction,
            sources: sources.iter().map(|s| s.as_ref().to_string()).collect(),
            destination: destination.into(),
            options: TransferOptions::default(),
        }
    }

    pub fn options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    /// Check the local side before connecting.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(ExecError::InvalidArgument("no sources given".into()));
        }
        match self.direction {
            Direction::Push => {
                for source in &self.sources {
                    if !Path::new(source).exists() {
                        return Err(ExecError::InvalidArgument(format!(
                            "{source}: no such file or directory"
                        )));
                    }
                }
            }
            Direction::Pull => {
                let destination = Path::new(&self.destination);
                if self.sources.len() > 1 && !destination.is_dir() {
                    return Err(ExecError::InvalidDestination(format!(
                        "{}: multiple sources need an existing directory",
                        self.destination
                    )));
                }
                let parent = destination
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."));
                if !destination.is_dir() && !parent.is_dir() {
                    return Err(ExecError::InvalidDestination(format!(
                        "{}: parent directory does not exist",
                        self.destination
                    )));
                }
            }
        }
        Ok(())
    }

    /// Command line for the peer's `scp`.
    pub fn remote_command(&self) -> String {
        let mut line = String::from("scp");
        if self.options.recursive {
            line.push_str(" -r");
        }
        if self.options.preserve_times {
            line.push_str(" -p");
        }
        match self.direction {
            Direction::Push => {
                line.push_str(" -t ");
                line.push_str(&shell_quote(&self.destination));
            }
            Direction::Pull => {
                line.push_str(" -f");
                for source in &self.sources {
                    line.push(' ');
                    line.push_str(&shell_quote(source));
                }
            }
        }
        line
    }
}

/// A running transfer on its own supervised worker.
pub struct Transfer {
    state: Arc<TransferState>,
    worker: Option<Worker<u64>>,
    outcome: Option<Result<u64>>,
}

impl Transfer {
    /// Validate the request and start the transfer.
    pub fn start<C: Connector>(
        connector: Arc<C>,
        target: Target,
        request: TransferRequest,
    ) -> Result<Self> {
        request.validate()?;
        let command = request.remote_command();
        let mut remote = RemoteCommand::new(command)
            .source_profile(false)
            .timeout(None)
            .connect_timeout(request.options.connect_timeout)
            .max_connect_attempts(request.options.max_connect_attempts);
        remote.tag = request.options.tag.clone();

        let session = Session::new(connector, target, remote)?;
        let state = Arc::new(TransferState::with_abort_flag(
            request.direction,
            request.sources.clone(),
            request.destination.clone(),
            Arc::clone(&session.shared().abort),
        ));

        let worker_state = Arc::clone(&state);
        let worker = WorkerBuilder::new()
            .name(format!("transfer:{}", session.key()))
            .spawn(move |token| run(&session, &request, &worker_state, token))?;

        Ok(Self {
            state,
            worker: Some(worker),
            outcome: None,
        })
    }

    /// Stop the transfer at its next chunk boundary.
    pub fn abort(&self) {
        debug!(transfer = %self.state.label(), "aborting transfer");
        self.state.request_abort();
        if let Some(worker) = &self.worker {
            worker.abort(Duration::ZERO);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| !w.is_alive())
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state.bytes_transferred()
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Wait for the transfer and return the payload bytes moved.
    pub fn wait(&mut self) -> Result<u64> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let result = match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => Err(self.state.aborted()),
                Err(e) => Err(e),
            },
            None => Err(ExecError::InvalidArgument("transfer was never started".into())),
        };
        self.outcome = Some(result.clone());
        result
    }
}

fn run<C: Connector>(
    session: &Session<C>,
    request: &TransferRequest,
    state: &TransferState,
    token: &CancelToken,
) -> Result<u64> {
    let mut opened = session.open(token, session.command_line())?;
    let result = exchange(&mut opened.channel, request, state, token);
    let code = session.settle(&mut opened, result)?;
    session.complete(&mut opened, code)?;
    info!(transfer = %state.label(), bytes = state.bytes_transferred(), "transfer finished");
    Ok(state.bytes_transferred())
}

fn exchange<Ch: crate::remote::Channel>(
    channel: &mut Ch,
    request: &TransferRequest,
    state: &TransferState,
    token: &CancelToken,
) -> Result<i32> {
    let mut stream = ChannelStream::new(channel, state, token);
    let engine = match request.direction {
        Direction::Push => {
            let sources: Vec<PathBuf> = request.sources.iter().map(PathBuf::from).collect();
            Source::new(state, request.options.recursive, request.options.preserve_times)
                .run(&mut stream, &sources)
        }
        Direction::Pull => Sink::new(state, &request.destination).run(&mut stream),
    };
    if let Err(e) = engine {
        let stderr = stream.stderr();
        if !stderr.is_empty() {
            debug!(%stderr, "transfer peer reported");
        }
        return Err(e);
    }
    let code = stream.finish()?;
    if code != 0 {
        return Err(ExecError::ProtocolError(format!(
            "remote scp exited with status {code}: {}",
            stream.stderr()
        )));
    }
    Ok(code)
}

/// Copy local `sources` to `destination` on `target`.
pub fn put<C: Connector, P: AsRef<Path>>(
    connector: &Arc<C>,
    target: &Target,
    sources: &[P],
    destination: &str,
    options: TransferOptions,
) -> Result<u64> {
    let sources: Vec<String> = sources
        .iter()
        .map(|p| p.as_ref().to_string_lossy().into_owned())
        .collect();
    let request = TransferRequest::push(sources.as_slice(), destination).options(options);
    Transfer::start(Arc::clone(connector), target.clone(), request)?.wait()
}

/// Copy remote `sources` on `target` to local `destination`.
pub fn get<C: Connector, S: AsRef<str>>(
    connector: &Arc<C>,
    target: &Target,
    sources: &[S],
    destination: impl AsRef<Path>,
    options: TransferOptions,
) -> Result<u64> {
    let destination = destination.as_ref().to_string_lossy().into_owned();
    let request = TransferRequest::pull(sources, destination).options(options);
    Transfer::start(Arc::clone(connector), target.clone(), request)?.wait()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command() {
        let push = TransferRequest::push(&["a.txt"], "/srv/my dir")
            .options(TransferOptions::default().preserve_times(true));
        assert_eq!(push.remote_command(), "scp -p -t '/srv/my dir'");

        let pull = TransferRequest::pull(&["/etc/hosts", "/etc/motd"], "out")
            .options(TransferOptions::default().recursive(true));
        assert_eq!(pull.remote_command(), "scp -r -f /etc/hosts /etc/motd");
    }

    #[test]
    fn test_pull_multiple_sources_need_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"").unwrap();

        let request = TransferRequest::pull(&["/a", "/b"], file.to_string_lossy());
        assert!(matches!(request.validate(), Err(ExecError::InvalidDestination(_))));

        let request = TransferRequest::pull(&["/a", "/b"], dir.path().to_string_lossy());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_pull_single_source_may_rename() {
        let dir = tempfile::tempdir().unwrap();
        let new_name = dir.path().join("renamed.txt");
        let request = TransferRequest::pull(&["/a"], new_name.to_string_lossy());
        assert!(request.validate().is_ok());

        let orphan = dir.path().join("missing/renamed.txt");
        let request = TransferRequest::pull(&["/a"], orphan.to_string_lossy());
        assert!(matches!(request.validate(), Err(ExecError::InvalidDestination(_))));
    }

    #[test]
    fn test_push_requires_local_sources() {
        let request = TransferRequest::push(&["/definitely/not/here"], "/tmp");
        assert!(matches!(request.validate(), Err(ExecError::InvalidArgument(_))));
    }

    #[test]
    fn test_state_label_and_abort() {
        let state = TransferState::new(Direction::Push, vec!["a".into(), "b".into()], "/d".into());
        assert_eq!(state.label(), "put a b -> /d");
        assert!(state.check_abort().is_ok());
        state.request_abort();
        assert!(matches!(state.check_abort(), Err(ExecError::Aborted { ref command }) if command == "put a b -> /d"));
    }
}
