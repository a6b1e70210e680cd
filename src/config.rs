//! Configuration management for shell-exec.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line `key=value` settings
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::execution::{self, Command};
use crate::remote::{self, Credential, RemoteCommand, Target, TransportOptions};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote execution defaults.
    pub remote: RemoteSection,
    /// Local execution defaults.
    pub local: LocalSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Remote execution section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub port: u16,
    pub user: String,
    pub connect_timeout_secs: u64,
    /// Unlimited when absent.
    pub max_connect_attempts: Option<u32>,
    /// Unbounded when absent.
    pub timeout_secs: Option<u64>,
    pub connection_tag: Option<String>,
    /// Disabled when absent.
    pub keepalive_secs: Option<u64>,
    pub term: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            port: remote::DEFAULT_PORT,
            user: remote::DEFAULT_PRINCIPAL.to_string(),
            connect_timeout_secs: remote::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            max_connect_attempts: None,
            timeout_secs: Some(remote::DEFAULT_TIMEOUT.as_secs()),
            connection_tag: None,
            keepalive_secs: Some(30),
            term: remote::DEFAULT_TERM.to_string(),
        }
    }
}

/// Local execution section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    /// Unbounded when absent.
    pub timeout_secs: Option<u64>,
    pub kill_grace_secs: u64,
    /// Termination signal, by name (`SIGTERM`, `TERM`) or number.
    pub signal: String,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            timeout_secs: Some(execution::DEFAULT_TIMEOUT.as_secs()),
            kill_grace_secs: execution::DEFAULT_GRACE.as_secs(),
            signal: "SIGABRT".to_string(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter
    /// directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Remote defaults resolved from configuration.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub principal: String,
    pub port: u16,
    pub connect_timeout: Option<Duration>,
    pub max_connect_attempts: Option<u32>,
    pub timeout: Option<Duration>,
    pub tag: Option<String>,
    pub keepalive: Option<Duration>,
    pub term: String,
}

impl RemoteOptions {
    /// Target for `endpoint` with these defaults and agent authentication.
    pub fn target(&self, endpoint: impl Into<String>) -> Target {
        Target::new(endpoint)
            .principal(self.principal.clone())
            .port(self.port)
            .options(TransportOptions {
                keepalive: self.keepalive,
                term: self.term.clone(),
            })
    }

    /// Remote command with these defaults.
    pub fn command(&self, line: impl Into<String>) -> RemoteCommand {
        let command = RemoteCommand::new(line)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .max_connect_attempts(self.max_connect_attempts);
        match &self.tag {
            Some(tag) => command.tag(tag.clone()),
            None => command,
        }
    }
}

/// Nonzero seconds as a duration, zero as "none".
fn seconds(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(user) = std::env::var("SHELL_EXEC_USER") {
            if !user.is_empty() {
                self.remote.user = user;
            }
        }

        if let Ok(port) = std::env::var("SHELL_EXEC_PORT") {
            if let Ok(port) = port.parse() {
                self.remote.port = port;
            }
        }

        if let Ok(secs) = std::env::var("SHELL_EXEC_CONNECT_TIMEOUT") {
            if let Ok(secs) = secs.parse() {
                self.remote.connect_timeout_secs = secs;
            }
        }

        if let Ok(level) = std::env::var("SHELL_EXEC_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(ref user) = args.user {
            self.remote.user = user.clone();
        }
        if let Some(port) = args.port {
            self.remote.port = port;
        }
        if let Some(secs) = args.connect_timeout {
            self.remote.connect_timeout_secs = secs;
        }
        if let Some(attempts) = args.attempts {
            self.remote.max_connect_attempts = Some(attempts);
        }
        if let Some(secs) = args.timeout {
            self.remote.timeout_secs = Some(secs);
        }
        if let Some(ref tag) = args.tag {
            self.remote.connection_tag = Some(tag.clone());
        }
        if let Some(secs) = args.keepalive {
            self.remote.keepalive_secs = Some(secs);
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
        if args.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        config.apply_env();
        config.apply_args(args);

        Ok(config)
    }

    /// Defaults for remote targets and commands.
    pub fn remote_defaults(&self) -> RemoteOptions {
        RemoteOptions {
            principal: self.remote.user.clone(),
            port: self.remote.port,
            connect_timeout: seconds(Some(self.remote.connect_timeout_secs)),
            max_connect_attempts: self.remote.max_connect_attempts.filter(|n| *n > 0),
            timeout: seconds(self.remote.timeout_secs),
            tag: self.remote.connection_tag.clone(),
            keepalive: seconds(self.remote.keepalive_secs),
            term: self.remote.term.clone(),
        }
    }

    /// Local command with the configured timeout, grace and signal.
    pub fn local_command(&self, line: impl Into<String>) -> Result<Command, ConfigError> {
        Ok(Command::new(line)
            .timeout(seconds(self.local.timeout_secs))
            .grace(Duration::from_secs(self.local.kill_grace_secs))
            .signal(signal_number(&self.local.signal)?))
    }

    /// Filter directive for the logging subscriber. A bare level applies
    /// to this crate only.
    pub fn log_filter(&self) -> String {
        let level = self.logging.level.trim();
        if level.contains('=') || level.contains(',') {
            level.to_string()
        } else {
            format!("shell_exec={level}")
        }
    }
}

/// Credential from CLI settings: key file, then password, then agent.
pub fn credential(args: &Args) -> Credential {
    match (&args.key_file, &args.password) {
        (Some(path), _) => Credential::KeyFile {
            path: path.clone(),
            passphrase: args.password.clone(),
        },
        (None, Some(password)) => Credential::Password(password.clone()),
        (None, None) => Credential::Agent,
    }
}

/// Resolve a signal name or number.
pub fn signal_number(name: &str) -> Result<i32, ConfigError> {
    if let Ok(number) = name.parse::<i32>() {
        return Ok(number);
    }
    let bare = name.trim_start_matches("SIG");
    let number = match bare {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ABRT" => 6,
        "KILL" => 9,
        "USR1" => 10,
        "USR2" => 12,
        "TERM" => 15,
        _ => return Err(ConfigError::InvalidSignal(name.to_string())),
    };
    #[cfg(unix)]
    let number = match bare {
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        _ => number,
    };
    Ok(number)
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Unknown signal name.
    InvalidSignal(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidSignal(name) => write!(f, "unknown signal: {}", name),
        }
    }
}

impl std::error::Error for ConfigError {}
