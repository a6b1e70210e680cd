//! Command building and representation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::output::Redirect;

/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// How long the kill sequence waits for the termination signal to work
/// before escalating to `SIGKILL`.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(600);

/// Default termination signal.
#[cfg(unix)]
pub const DEFAULT_SIGNAL: i32 = libc::SIGABRT;
#[cfg(not(unix))]
pub const DEFAULT_SIGNAL: i32 = 6;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Executed directly, no shell involved.
    Argv(Vec<String>),
    /// Handed to `/bin/sh -c`.
    Shell(String),
}

/// A local command to execute.
#[derive(Debug, Clone)]
pub struct Command {
    pub program: Program,
    /// Working directory override (if any).
    pub working_dir: Option<PathBuf>,
    /// Environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
    /// Maximum execution time; `None` never times out.
    pub timeout: Option<Duration>,
    /// Signal sent first by the kill sequence.
    pub signal: i32,
    /// Wait after `signal` before `SIGKILL`.
    pub grace: Duration,
}

impl Command {
    /// A shell command line.
    pub fn new(command_line: impl Into<String>) -> Self {
        Self::with_program(Program::Shell(command_line.into()))
    }

    /// A program and its arguments.
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_program(Program::Argv(args.into_iter().map(Into::into).collect()))
    }

    fn with_program(program: Program) -> Self {
        Self {
            program,
            working_dir: None,
            env: HashMap::new(),
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
            timeout: Some(DEFAULT_TIMEOUT),
            signal: DEFAULT_SIGNAL,
            grace: DEFAULT_GRACE,
        }
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
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

    /// `Capture` gives the caller a pipe to write to.
    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
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

    /// Capture both output streams.
    pub fn capture(self) -> Self {
        self.stdout(Redirect::Capture).stderr(Redirect::Capture)
    }

    /// Set the execution timeout; `None` disables it.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn signal(mut self, signal: i32) -> Self {
        self.signal = signal;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.program {
            Program::Shell(line) => f.write_str(line),
            Program::Argv(args) => f.write_str(&crate::remote::shell_cmd(args)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_new() {
        let cmd = Command::new("ls -la");
        assert_eq!(cmd.program, Program::Shell("ls -la".into()));
        assert!(cmd.working_dir.is_none());
        assert!(cmd.env.is_empty());
        assert_eq!(cmd.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(cmd.stdout, Redirect::Inherit);
    }

    #[test]
    fn test_command_builder_chain() {
        let cmd = Command::new("cargo build")
            .working_dir("/project")
            .env("RUST_LOG", "debug")
            .timeout(Some(Duration::from_secs(60)))
            .grace(Duration::from_secs(5))
            .capture();

        assert_eq!(cmd.working_dir, Some(PathBuf::from("/project")));
        assert_eq!(cmd.env.get("RUST_LOG"), Some(&"debug".to_string()));
        assert_eq!(cmd.timeout, Some(Duration::from_secs(60)));
        assert_eq!(cmd.grace, Duration::from_secs(5));
        assert_eq!(cmd.stderr, Redirect::Capture);
    }

    #[test]
    fn test_command_envs() {
        let vars = [("KEY1", "val1"), ("KEY2", "val2")];
        let cmd = Command::new("echo").envs(vars);

        assert_eq!(cmd.env.len(), 2);
        assert_eq!(cmd.env.get("KEY2"), Some(&"val2".to_string()));
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::argv(["grep", "a b", "f"]).to_string(), "grep 'a b' f");
        assert_eq!(Command::new("echo $HOME").to_string(), "echo $HOME");
    }
}
