//! Local process control with deadline-driven kill escalation.
//!
//! A [`Process`] tracks a child's deadline. Any wait that runs past it
//! triggers the kill sequence ([`Process::die`]):
//!
//! 1. signal the first direct child of the tracked process, if any;
//! 2. signal the tracked process itself;
//! 3. poll for its exit about once a second for the grace window;
//! 4. `SIGKILL` it.
//!
//! Exit codes are the normal exit status, or `-signal` when the process was
//! terminated by a signal.

use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use super::command::{Command, Program};
use crate::error::ExecError;
use crate::output::{Redirect, StreamBuffer};
use crate::Result;

const SHELL: &str = "/bin/sh";

/// Interval between exit checks during the kill grace window.
const DIE_POLL: Duration = Duration::from_secs(1);

/// Upper bound of the backoff between exit checks while waiting.
const WAIT_POLL_MAX: Duration = Duration::from_millis(50);

/// Serialises signal delivery to one process.
///
/// Serializes as a unit placeholder; deserializing produces a fresh lock.
#[derive(Debug, Clone, Default)]
pub struct SnapshotLock(Arc<Mutex<()>>);

impl SnapshotLock {
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Serialize for SnapshotLock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> Deserialize<'de> for SnapshotLock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        <()>::deserialize(deserializer)?;
        Ok(Self::default())
    }
}

/// Serializable view of a running process, enough to signal it from
/// elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub command: String,
    pub timeout: Option<Duration>,
    pub signal: i32,
    pub elapsed: Duration,
    pub grace: Duration,
    pub lock: SnapshotLock,
}

impl ProcessSnapshot {
    /// Send the configured termination signal to the process.
    pub fn signal_process(&self) -> Result<()> {
        let _guard = self.lock.lock();
        send_signal(self.pid, self.signal)
    }
}

/// A running local child process.
pub struct Process {
    child: Child,
    pid: u32,
    command: String,
    started: Instant,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    signal: i32,
    grace: Duration,
    stdin: Option<ChildStdin>,
    stdout: Option<Arc<StreamBuffer>>,
    stderr: Option<Arc<StreamBuffer>>,
    merged: bool,
    readers: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
    lock: SnapshotLock,
}

impl Process {
    /// Start `command`.
    pub fn spawn(command: &Command) -> Result<Self> {
        let mut std_cmd = match &command.program {
            Program::Shell(line) => {
                let mut c = std::process::Command::new(SHELL);
                c.arg("-c").arg(line);
                c
            }
            Program::Argv(args) => {
                let (program, rest) = args
                    .split_first()
                    .ok_or_else(|| ExecError::InvalidArgument("empty argv".into()))?;
                let mut c = std::process::Command::new(program);
                c.args(rest);
                c
            }
        };
        std_cmd.envs(&command.env);
        if let Some(dir) = &command.working_dir {
            std_cmd.current_dir(dir);
        }

        std_cmd.stdin(match command.stdin {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::Capture => Stdio::piped(),
            Redirect::Merge => {
                return Err(ExecError::InvalidArgument("stdin cannot be merged".into()))
            }
        });
        let merged_reader = configure_output(&mut std_cmd, command.stdout, command.stderr)?;

        let mut child = std_cmd.spawn()?;
        // The parent's copies of shared pipe ends must close for EOF.
        drop(std_cmd);

        let pid = child.id();
        let started = Instant::now();
        let mut readers = Vec::new();
        let stdout = match (merged_reader, child.stdout.take()) {
            (Some(file), _) => Some(capture(file, &mut readers)),
            (None, Some(pipe)) => Some(capture(pipe, &mut readers)),
            (None, None) => None,
        };
        let merged = command.stderr == Redirect::Merge;
        let stderr = match child.stderr.take() {
            Some(pipe) => Some(capture(pipe, &mut readers)),
            None if merged => stdout.clone(),
            None => None,
        };

        let text = command.to_string();
        debug!(pid, command = %text, "process started");
        Ok(Self {
            stdin: child.stdin.take(),
            child,
            pid,
            command: text,
            started,
            timeout: command.timeout,
            deadline: command.timeout.map(|t| started + t),
            signal: command.signal,
            grace: command.grace,
            stdout,
            stderr,
            merged,
            readers,
            exit_code: None,
            lock: SnapshotLock::default(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Exit code once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Captured stdout, readable while the process runs.
    pub fn stdout(&self) -> Option<Arc<StreamBuffer>> {
        self.stdout.clone()
    }

    /// Captured stderr. Shares the stdout buffer when merged.
    pub fn stderr(&self) -> Option<Arc<StreamBuffer>> {
        self.stderr.clone()
    }

    /// Write to a captured stdin.
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExecError::InvalidArgument("stdin is not a pipe".into()))?;
        stdin.write_all(data)?;
        stdin.flush()?;
        Ok(())
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Replace the timeout, counting from now.
    pub fn update_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        self.deadline = timeout.map(|t| Instant::now() + t);
    }

    /// Non-blocking status check. Past the deadline the process is killed
    /// and `Timeout` returned.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        if let Some(status) = self.child.try_wait()? {
            return Ok(Some(self.reap(status)));
        }
        if self.deadline.is_some_and(|d| Instant::now() > d) {
            self.die()?;
            return Err(self.timeout_error());
        }
        Ok(None)
    }

    /// Wait for the process to exit.
    ///
    /// An explicit `timeout` replaces the deadline, counting from now. On
    /// expiry the kill sequence runs and `Timeout` is returned.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<i32> {
        if timeout.is_some() {
            self.update_timeout(timeout);
        }
        let mut pause = Duration::from_millis(1);
        loop {
            if let Some(code) = self.poll()? {
                return Ok(code);
            }
            let pause_until_deadline = self
                .deadline
                .map_or(pause, |d| d.saturating_duration_since(Instant::now()));
            thread::sleep(pause.min(pause_until_deadline).max(Duration::from_millis(1)));
            pause = (pause * 2).min(WAIT_POLL_MAX);
        }
    }

    /// [`wait`](Self::wait) with a different termination signal. The
    /// previous signal is restored unless the wait timed out.
    pub fn wait_with_signal(&mut self, signal: i32, timeout: Option<Duration>) -> Result<i32> {
        let previous = std::mem::replace(&mut self.signal, signal);
        let result = self.wait(timeout);
        if !matches!(result, Err(ExecError::Timeout { .. })) {
            self.signal = previous;
        }
        result
    }

    /// Wait, failing with `NonZeroExit` on a nonzero exit code.
    pub fn check_wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.wait(timeout)? {
            0 => Ok(()),
            code => Err(ExecError::NonZeroExit {
                code,
                command: self.command.clone(),
                pid: Some(self.pid),
                output: None,
            }),
        }
    }

    /// Write `input`, close stdin and wait. Returns captured stdout and
    /// stderr, empty for streams that are not captured or merged.
    pub fn communicate(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let input = input.filter(|i| !i.is_empty());
        let writer = match (self.stdin.take(), input) {
            (Some(mut stdin), Some(input)) => {
                let input = input.to_vec();
                Some(thread::spawn(move || {
                    // A child that exits without reading yields EPIPE.
                    let _ = stdin.write_all(&input);
                }))
            }
            (None, Some(_)) => {
                return Err(ExecError::InvalidArgument("stdin is not a pipe".into()));
            }
            (_, None) => None,
        };

        // Pipes stay open while any descendant holds them, so the threads
        // are joined against the same deadline as the process.
        self.wait(timeout)?;
        let mut pending = std::mem::take(&mut self.readers);
        pending.extend(writer);
        if !join_before(pending, self.deadline) {
            debug!(pid = self.pid, "output still open past the deadline");
            self.die()?;
            return Err(self.timeout_error());
        }

        let stdout = self.stdout.as_ref().map(|b| b.contents()).unwrap_or_default();
        let stderr = match (&self.stderr, self.merged) {
            (Some(buffer), false) => buffer.contents(),
            _ => Vec::new(),
        };
        Ok((stdout, stderr))
    }

    /// Run the kill sequence. Succeeds when the process is gone.
    pub fn die(&mut self) -> Result<()> {
        self.deadline = None;
        if self.exit_code.is_some() {
            return Ok(());
        }
        if let Some(status) = self.child.try_wait()? {
            self.reap(status);
            return Ok(());
        }

        {
            let _guard = self.lock.lock();
            if let Some(child) = first_child(self.pid) {
                debug!(pid = self.pid, child, signal = self.signal, "signalling child process");
                send_signal(child, self.signal)?;
            }
            debug!(pid = self.pid, signal = self.signal, "signalling process");
            send_signal(self.pid, self.signal)?;
        }

        let until = Instant::now() + self.grace;
        let mut pause = Duration::from_millis(10);
        loop {
            thread::sleep(pause.min(until.saturating_duration_since(Instant::now())));
            if let Some(status) = self.child.try_wait()? {
                self.reap(status);
                return Ok(());
            }
            if Instant::now() >= until {
                break;
            }
            pause = DIE_POLL;
        }

        warn!(pid = self.pid, grace = ?self.grace, "process survived its signal, killing");
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        let status = self.child.wait()?;
        self.reap(status);
        Ok(())
    }

    /// Capture what is needed to signal this process elsewhere.
    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            pid: self.pid,
            command: self.command.clone(),
            timeout: self.timeout,
            signal: self.signal,
            elapsed: self.elapsed(),
            grace: self.grace,
            lock: self.lock.clone(),
        }
    }

    fn reap(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        debug!(pid = self.pid, code, "process exited");
        self.exit_code = Some(code);
        self.stdin = None;
        code
    }

    fn timeout_error(&self) -> ExecError {
        ExecError::Timeout {
            command: self.command.clone(),
            limit: self.timeout,
            pid: Some(self.pid),
        }
    }
}

/// Set up stdout and stderr. Returns the read end of a shared pipe when
/// stderr is merged into a captured stdout.
fn configure_output(
    cmd: &mut std::process::Command,
    stdout: Redirect,
    stderr: Redirect,
) -> Result<Option<File>> {
    let plain = |redirect: Redirect| match redirect {
        Redirect::Inherit => Stdio::inherit(),
        Redirect::Null => Stdio::null(),
        Redirect::Capture | Redirect::Merge => Stdio::piped(),
    };
    match (stdout, stderr) {
        (Redirect::Merge, _) => Err(ExecError::InvalidArgument(
            "stdout cannot be merged".into(),
        )),
        (Redirect::Capture, Redirect::Merge) => {
            let (read, write) = shared_pipe()?;
            cmd.stdout(Stdio::from(write.try_clone()?));
            cmd.stderr(Stdio::from(write));
            Ok(Some(read))
        }
        (Redirect::Inherit, Redirect::Merge) => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::from(io::stdout()));
            Ok(None)
        }
        (Redirect::Null, Redirect::Merge) => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
            Ok(None)
        }
        (out, err) => {
            cmd.stdout(plain(out));
            cmd.stderr(plain(err));
            Ok(None)
        }
    }
}

/// A close-on-exec pipe whose write end can back two stdio slots.
#[cfg(unix)]
fn shared_pipe() -> Result<(File, File)> {
    use std::os::fd::FromRawFd;

    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    for fd in fds {
        // SAFETY: `fd` was just returned by pipe(2) and is owned here.
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
    // SAFETY: both descriptors are open and owned by nothing else.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok((read, write))
}

#[cfg(not(unix))]
fn shared_pipe() -> Result<(File, File)> {
    Err(ExecError::InvalidArgument(
        "merging stderr into captured stdout needs unix pipes".into(),
    ))
}

/// Join `handles` once all have finished. Returns false, leaving them
/// detached, if `deadline` passes first.
fn join_before(handles: Vec<JoinHandle<()>>, deadline: Option<Instant>) -> bool {
    let mut pause = Duration::from_millis(1);
    loop {
        if handles.iter().all(JoinHandle::is_finished) {
            for handle in handles {
                let _ = handle.join();
            }
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        thread::sleep(pause);
        pause = (pause * 2).min(WAIT_POLL_MAX);
    }
}

fn capture<R: Read + Send + 'static>(
    mut from: R,
    readers: &mut Vec<JoinHandle<()>>,
) -> Arc<StreamBuffer> {
    let buffer = Arc::new(StreamBuffer::new());
    let sink = Arc::clone(&buffer);
    readers.push(thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match from.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.write(&buf[..n]),
            }
        }
    }));
    buffer
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// First direct child of `pid` in the process table.
fn first_child(pid: u32) -> Option<u32> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());
    let parent = Pid::from_u32(pid);
    let mut children: Vec<u32> = system
        .processes()
        .values()
        .filter(|p| p.parent() == Some(parent))
        .map(|p| p.pid().as_u32())
        .collect();
    children.sort_unstable();
    children.first().copied()
}

/// Send `signal` to `pid`. A process that is already gone counts as success.
#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| ExecError::InvalidArgument(format!("pid {pid} out of range")))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: i32) -> Result<()> {
    Err(ExecError::InvalidArgument(format!(
        "cannot signal pid {pid} on this platform"
    )))
}

/// Run `command` and return its exit code.
pub fn call(command: &Command) -> Result<i32> {
    let mut process = Process::spawn(command)?;
    process.communicate(None, None)?;
    process.wait(None)
}

/// Run `command`, failing with `NonZeroExit` on a nonzero exit code.
pub fn check_call(command: &Command) -> Result<()> {
    let mut process = Process::spawn(command)?;
    process.communicate(None, None)?;
    process.check_wait(None)
}

/// Run `command` and return its stdout.
///
/// Stdout must be left at its default; it is captured here. The error for a
/// nonzero exit carries the captured output.
pub fn check_output(command: &Command) -> Result<Vec<u8>> {
    if command.stdout != Redirect::Inherit {
        return Err(ExecError::InvalidArgument(
            "stdout is captured by check_output".into(),
        ));
    }
    let command = command.clone().stdout(Redirect::Capture);
    let mut process = Process::spawn(&command)?;
    let (stdout, _) = process.communicate(None, None)?;
    match process.wait(None)? {
        0 => Ok(stdout),
        code => Err(ExecError::NonZeroExit {
            code,
            command: process.command.clone(),
            pid: Some(process.pid),
            output: Some(stdout),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_and_output() {
        let mut process = Process::spawn(&Command::new("echo hi; echo oops >&2; exit 4").capture()).unwrap();
        let (out, err) = process.communicate(None, None).unwrap();
        assert_eq!(out, b"hi\n");
        assert_eq!(err, b"oops\n");
        assert_eq!(process.exit_code(), Some(4));
    }

    #[test]
    fn test_merged_stderr() {
        let command = Command::new("echo one; echo two >&2")
            .stdout(Redirect::Capture)
            .stderr(Redirect::Merge);
        let mut process = Process::spawn(&command).unwrap();
        let (out, err) = process.communicate(None, None).unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "one\ntwo\n");
        assert!(err.is_empty());
    }

    #[test]
    fn test_stdin_roundtrip() {
        let command = Command::new("tr a-z A-Z")
            .stdin(Redirect::Capture)
            .stdout(Redirect::Capture);
        let mut process = Process::spawn(&command).unwrap();
        let (out, _) = process.communicate(Some(b"shout"), None).unwrap();
        assert_eq!(out, b"SHOUT");
    }

    #[test]
    fn test_timeout_kills_with_signal() {
        let command = Command::new("sleep 30").timeout(Some(Duration::from_millis(200)));
        let mut process = Process::spawn(&command).unwrap();
        let started = Instant::now();
        let err = process.wait(None).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { pid: Some(p), .. } if p == process.pid()));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(process.exit_code(), Some(-libc::SIGABRT));
    }

    #[test]
    fn test_communicate_deadline_covers_inherited_pipes() {
        let command = Command::new("sleep 5 & echo hi").capture();
        let mut process = Process::spawn(&command).unwrap();
        let started = Instant::now();

        let err = process.communicate(None, Some(Duration::from_millis(500))).unwrap_err();
        assert!(matches!(err, ExecError::Timeout { pid: Some(p), .. } if p == process.pid()));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(process.exit_code(), Some(0));
        assert_eq!(process.stdout().unwrap().text(), "hi\n");
    }

    #[test]
    fn test_escalates_to_sigkill() {
        let command = Command::new("trap '' TERM; while :; do sleep 0.1; done")
            .signal(libc::SIGTERM)
            .grace(Duration::from_millis(300))
            .timeout(Some(Duration::from_millis(100)));
        let mut process = Process::spawn(&command).unwrap();
        assert!(matches!(process.wait(None), Err(ExecError::Timeout { .. })));
        assert_eq!(process.exit_code(), Some(-libc::SIGKILL));
    }

    #[test]
    fn test_wait_with_signal_restores_signal() {
        let mut process = Process::spawn(&Command::new("true")).unwrap();
        assert_eq!(process.wait_with_signal(libc::SIGTERM, None).unwrap(), 0);
        assert_eq!(process.snapshot().signal, libc::SIGABRT);
    }

    #[test]
    fn test_check_helpers() {
        assert_eq!(call(&Command::new("exit 2")).unwrap(), 2);
        assert!(check_call(&Command::new("true")).is_ok());

        let err = check_output(&Command::new("echo partial; exit 1")).unwrap_err();
        assert_eq!(err.output(), Some(&b"partial\n"[..]));

        let capture = Command::new("true").stdout(Redirect::Capture);
        assert!(matches!(check_output(&capture), Err(ExecError::InvalidArgument(_))));
    }

    #[test]
    fn test_snapshot_serializes_lock_as_unit() {
        let process = Process::spawn(&Command::new("sleep 5")).unwrap();
        let snapshot = process.snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["lock"].is_null());

        let restored: ProcessSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(restored.pid, process.pid());
        restored.signal_process().unwrap();

        let mut process = process;
        assert_eq!(process.wait(None).unwrap(), -libc::SIGABRT);
    }
}
