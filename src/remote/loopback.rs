//! Loopback transport: "remote" commands run on this machine.
//!
//! Commands are handed to `/bin/sh -c`. A peer `scp -t`/`scp -f` is served
//! in-process by the crate's own sink and source engines, so transfers work
//! without an `scp` binary. Endpoints under the reserved `.invalid` domain
//! never connect.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shell_exec::remote::{self, loopback::LoopbackConnector, RemoteCommand, Target};
//!
//! # fn main() -> shell_exec::Result<()> {
//! let connector = Arc::new(LoopbackConnector::new());
//! let target = Target::new("localhost").principal("tester");
//! let out = remote::check_output(&connector, &target, RemoteCommand::new("echo hi"))?;
//! assert_eq!(out, b"hi\n");
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::pool::ConnectionPool;
use super::target::Target;
use super::transport::{Channel, Connector, StreamRead, Transport, TransportError};
use crate::error::ExecError;
use crate::transfer::{ByteStream, Direction, Sink, Source, TransferState};
use crate::Result;

const SHELL: &str = "/bin/sh";

/// Makes `source` available under shells that only know `.`.
const SOURCE_SHIM: &str = "source() { if [ -r \"$1\" ]; then . \"$1\"; fi; }; ";

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct PipeInner {
    data: VecDeque<u8>,
    closed: bool,
}

/// Unbounded in-memory pipe between a channel and its peer.
#[derive(Debug, Default)]
struct Pipe {
    inner: Mutex<PipeInner>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) {
        let mut inner = relock(&self.inner);
        inner.data.extend(bytes);
        self.ready.notify_all();
    }

    fn close(&self) {
        relock(&self.inner).closed = true;
        self.ready.notify_all();
    }

    fn try_read(&self, max: usize) -> StreamRead {
        let mut inner = relock(&self.inner);
        if inner.data.is_empty() {
            return if inner.closed {
                StreamRead::Closed
            } else {
                StreamRead::Pending
            };
        }
        let n = max.min(inner.data.len());
        StreamRead::Data(inner.data.drain(..n).collect())
    }

    /// Block until data arrives. Returns 0 once closed and empty.
    fn read_blocking(&self, buf: &mut [u8]) -> usize {
        let mut inner = relock(&self.inner);
        while inner.data.is_empty() && !inner.closed {
            inner = self
                .ready
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let n = buf.len().min(inner.data.len());
        for (slot, byte) in buf.iter_mut().zip(inner.data.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn is_closed(&self) -> bool {
        relock(&self.inner).closed
    }
}

/// Copy `from` into `pipe` until end of stream, then close it.
fn pump_into<R: Read + Send + 'static>(mut from: R, pipe: Arc<Pipe>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match from.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => pipe.push(&buf[..n]),
            }
        }
        pipe.close();
    });
}

/// Copy `pipe` into `to` until the pipe closes, then drop `to`.
fn pump_from<W: Write + Send + 'static>(pipe: Arc<Pipe>, mut to: W) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = pipe.read_blocking(&mut buf);
            if n == 0 || to.write_all(&buf[..n]).is_err() {
                break;
            }
            let _ = to.flush();
        }
    });
}

/// Peer end of a channel as seen by an in-process engine.
struct PeerStream {
    input: Arc<Pipe>,
    output: Arc<Pipe>,
}

impl ByteStream for PeerStream {
    fn send_all(&mut self, data: &[u8]) -> Result<()> {
        if self.output.is_closed() {
            return Err(ExecError::Transport("channel closed".into()));
        }
        self.output.push(data);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.input.read_blocking(buf))
    }
}

/// Split a shell command line into words. Handles the quoting that
/// [`shell_quote`](super::shell_quote) produces plus double quotes.
fn split_words(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut word: Option<String> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if let Some(w) = word.take() {
                    words.push(w);
                }
            }
            '\'' => {
                let w = word.get_or_insert_with(String::new);
                loop {
                    match chars.next()? {
                        '\'' => break,
                        other => w.push(other),
                    }
                }
            }
            '"' => {
                let w = word.get_or_insert_with(String::new);
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => w.push(chars.next()?),
                        other => w.push(other),
                    }
                }
            }
            '\\' => word.get_or_insert_with(String::new).push(chars.next()?),
            other => word.get_or_insert_with(String::new).push(other),
        }
    }
    words.extend(word);
    Some(words)
}

#[derive(Debug, PartialEq, Eq)]
struct ScpInvocation {
    direction: Direction,
    recursive: bool,
    preserve_times: bool,
    paths: Vec<String>,
}

/// Recognise `scp [-r] [-p] -t DEST` and `scp [-r] [-p] -f SRC...`.
fn parse_scp(line: &str) -> Option<ScpInvocation> {
    let words = split_words(line)?;
    let (program, args) = words.split_first()?;
    if program != "scp" {
        return None;
    }
    let mut invocation = ScpInvocation {
        direction: Direction::Push,
        recursive: false,
        preserve_times: false,
        paths: Vec::new(),
    };
    let mut mode = None;
    for arg in args {
        match arg.as_str() {
            "-r" => invocation.recursive = true,
            "-p" => invocation.preserve_times = true,
            // Peer `-t` is our push, peer `-f` our pull.
            "-t" => mode = Some(Direction::Push),
            "-f" => mode = Some(Direction::Pull),
            path => invocation.paths.push(path.to_string()),
        }
    }
    invocation.direction = mode?;
    let arity_ok = match invocation.direction {
        Direction::Push => invocation.paths.len() == 1,
        Direction::Pull => !invocation.paths.is_empty(),
    };
    arity_ok.then_some(invocation)
}

/// Connector for [`LoopbackTransport`]. Each instance owns its pool.
#[derive(Debug, Default)]
pub struct LoopbackConnector {
    pool: ConnectionPool<LoopbackTransport>,
    connects: AtomicUsize,
    refuse: AtomicUsize,
    latency: Duration,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(self, n: usize) -> Self {
        self.refuse.store(n, Ordering::SeqCst);
        self
    }

    /// Delay every stdin write and stdout read by `latency`.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of connection attempts so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    fn connect(&self, target: &Target) -> Result<LoopbackTransport> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(target.connect_failure(Some("connection refused".into())));
        }
        if target.endpoint.ends_with(".invalid") {
            return Err(target.connect_failure(Some(format!(
                "{}: name does not resolve",
                target.endpoint
            ))));
        }
        debug!(endpoint = %target.endpoint, attempt, "loopback connection opened");
        Ok(LoopbackTransport {
            id: attempt,
            latency: self.latency,
            closed: AtomicBool::new(false),
            severed: Mutex::new(None),
        })
    }

    fn pool(&self) -> &ConnectionPool<LoopbackTransport> {
        &self.pool
    }
}

/// One loopback "connection".
#[derive(Debug)]
pub struct LoopbackTransport {
    id: usize,
    latency: Duration,
    closed: AtomicBool,
    severed: Mutex<Option<TransportError>>,
}

impl LoopbackTransport {
    /// Which connect attempt produced this connection, from 1.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Break the connection: later channel opens fail as a lost socket.
    pub fn sever(&self) {
        *relock(&self.severed) = Some(TransportError::broken("connection reset by peer"));
    }
}

impl Transport for LoopbackTransport {
    type Channel = LoopbackChannel;

    fn open_channel(&self) -> Result<LoopbackChannel> {
        if let Some(error) = relock(&self.severed).as_ref() {
            return Err(ExecError::Transport(error.message.clone()));
        }
        if self.is_closed() {
            return Err(ExecError::Transport("connection closed".into()));
        }
        Ok(LoopbackChannel {
            latency: self.latency,
            pty: false,
            running: None,
        })
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(id = self.id, "loopback connection closed");
        Ok(())
    }

    fn last_error(&self) -> Option<TransportError> {
        relock(&self.severed).clone()
    }
}

enum Peer {
    Shell(Child),
    Engine(Arc<Mutex<Option<i32>>>),
}

struct Running {
    peer: Peer,
    stdin: Arc<Pipe>,
    stdout: Arc<Pipe>,
    stderr: Arc<Pipe>,
}

/// A command channel on a [`LoopbackTransport`].
pub struct LoopbackChannel {
    latency: Duration,
    pty: bool,
    running: Option<Running>,
}

impl LoopbackChannel {
    fn running(&mut self) -> Result<&mut Running> {
        self.running
            .as_mut()
            .ok_or_else(|| ExecError::Transport("no command started on channel".into()))
    }

    fn delay(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }

    fn spawn_shell(&self, command: &str) -> Result<Running> {
        // A terminal has one output stream.
        let merge = if self.pty { "exec 2>&1; " } else { "" };
        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(format!("{merge}{SOURCE_SHIM}{command}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = Arc::new(Pipe::default());
        let stdout = Arc::new(Pipe::default());
        let stderr = Arc::new(Pipe::default());
        if let Some(pipe) = child.stdin.take() {
            pump_from(Arc::clone(&stdin), pipe);
        }
        if let Some(pipe) = child.stdout.take() {
            pump_into(pipe, Arc::clone(&stdout));
        }
        if let Some(pipe) = child.stderr.take() {
            pump_into(pipe, Arc::clone(&stderr));
        }
        Ok(Running {
            peer: Peer::Shell(child),
            stdin,
            stdout,
            stderr,
        })
    }

    fn spawn_engine(invocation: ScpInvocation) -> Running {
        let stdin = Arc::new(Pipe::default());
        let stdout = Arc::new(Pipe::default());
        let stderr = Arc::new(Pipe::default());
        let exit = Arc::new(Mutex::new(None));

        let mut stream = PeerStream {
            input: Arc::clone(&stdin),
            output: Arc::clone(&stdout),
        };
        let (err_pipe, exit_slot) = (Arc::clone(&stderr), Arc::clone(&exit));
        thread::spawn(move || {
            let state = TransferState::new(
                invocation.direction,
                invocation.paths.clone(),
                String::new(),
            );
            let result = match invocation.direction {
                Direction::Push => Sink::new(&state, &invocation.paths[0]).run(&mut stream),
                Direction::Pull => {
                    let paths: Vec<PathBuf> = invocation.paths.iter().map(PathBuf::from).collect();
                    Source::new(&state, invocation.recursive, invocation.preserve_times)
                        .run(&mut stream, &paths)
                }
            };
            let code = match result {
                Ok(()) => 0,
                Err(e) => {
                    err_pipe.push(format!("scp: {e}\n").as_bytes());
                    1
                }
            };
            stream.output.close();
            err_pipe.close();
            *relock(&exit_slot) = Some(code);
        });

        Running {
            peer: Peer::Engine(exit),
            stdin,
            stdout,
            stderr,
        }
    }
}

impl Channel for LoopbackChannel {
    fn request_pty(&mut self, _term: &str) -> Result<()> {
        self.pty = true;
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<()> {
        if self.running.is_some() {
            return Err(ExecError::Transport("channel already has a command".into()));
        }
        let running = match parse_scp(command) {
            Some(invocation) => Self::spawn_engine(invocation),
            None => self.spawn_shell(command)?,
        };
        self.running = Some(running);
        Ok(())
    }

    fn read_stdout(&mut self, max: usize) -> Result<StreamRead> {
        self.delay();
        Ok(self.running()?.stdout.try_read(max))
    }

    fn read_stderr(&mut self, max: usize) -> Result<StreamRead> {
        Ok(self.running()?.stderr.try_read(max))
    }

    fn write_stdin(&mut self, data: &[u8]) -> Result<usize> {
        self.delay();
        let running = self.running()?;
        if running.stdin.is_closed() {
            return Err(ExecError::Transport("stdin already closed".into()));
        }
        running.stdin.push(data);
        Ok(data.len())
    }

    fn send_eof(&mut self) -> Result<()> {
        self.running()?.stdin.close();
        Ok(())
    }

    fn exit_status_ready(&mut self) -> Result<bool> {
        let running = self.running()?;
        let exited = match &mut running.peer {
            Peer::Shell(child) => child.try_wait()?.is_some(),
            Peer::Engine(exit) => relock(exit).is_some(),
        };
        Ok(exited && running.stdout.is_closed())
    }

    fn exit_status(&mut self) -> Result<i32> {
        let running = self.running()?;
        match &mut running.peer {
            Peer::Shell(child) => {
                let status = child.wait()?;
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(signal) = status.signal() {
                        return Ok(128 + signal);
                    }
                }
                Ok(status.code().unwrap_or(-1))
            }
            Peer::Engine(exit) => Ok(relock(exit).unwrap_or(-1)),
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        running.stdin.close();
        if let Peer::Shell(child) = &mut running.peer {
            if child.try_wait()?.is_none() {
                debug!(pid = child.id(), "killing loopback command on close");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        Ok(())
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
