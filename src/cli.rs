//! Command-line interface for shell-exec.
//!
//! Options come first, then the endpoint. Everything after the endpoint
//! is the remote command, except `key=value` words naming a known setting,
//! which override the configuration for this run.

use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Log at debug level.
    pub verbose: bool,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Host to run the command on.
    pub endpoint: Option<String>,
    /// Command words, joined with spaces for the remote shell.
    pub command: Vec<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    /// Execution timeout in seconds; 0 disables it.
    pub timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub attempts: Option<u32>,
    pub tag: Option<String>,
    /// Keepalive interval in seconds; 0 disables it.
    pub keepalive: Option<u64>,
    pub pty: bool,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

impl Args {
    /// The command line sent to the endpoint.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Apply one `key=value` override. Returns `Ok(false)` when `key` is
    /// not a known setting.
    fn apply_override(&mut self, key: &str, value: &str) -> Result<bool, ArgsError> {
        let invalid = || ArgsError::InvalidValue(key.to_string(), value.to_string());
        match key {
            "user" => self.user = Some(value.to_string()),
            "port" => self.port = Some(value.parse().map_err(|_| invalid())?),
            "password" => self.password = Some(value.to_string()),
            "key_file" => self.key_file = Some(PathBuf::from(value)),
            "timeout" => self.timeout = Some(value.parse().map_err(|_| invalid())?),
            "connect_timeout" => self.connect_timeout = Some(value.parse().map_err(|_| invalid())?),
            "attempts" => self.attempts = Some(value.parse().map_err(|_| invalid())?),
            "tag" => self.tag = Some(value.to_string()),
            "keepalive" => self.keepalive = Some(value.parse().map_err(|_| invalid())?),
            "pty" => {
                self.pty = match value {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => return Err(invalid()),
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn push_word(&mut self, word: String) -> Result<(), ArgsError> {
        if let Some((key, value)) = word.split_once('=') {
            if self.apply_override(key, value)? {
                return Ok(());
            }
        }
        self.command.push(word);
        Ok(())
    }
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('v') | Long("verbose") => {
                result.verbose = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                result.endpoint = Some(val.string()?);
                // The command may carry its own dash options.
                for word in parser.raw_args()? {
                    let word = word
                        .into_string()
                        .map_err(|w| ArgsError::UnexpectedArgument(w.to_string_lossy().into()))?;
                    result.push_word(word)?;
                }
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    if !result.help && !result.version {
        if result.endpoint.is_none() {
            return Err(ArgsError::Missing("endpoint"));
        }
        if result.command.is_empty() {
            return Err(ArgsError::Missing("command"));
        }
    }
    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"shell-exec {version}
Run a command on a remote host with timeout, retry and failure reporting

USAGE:
    shell-exec [OPTIONS] <ENDPOINT> <COMMAND>... [KEY=VALUE]...

OPTIONS:
    -v, --verbose           Log at debug level
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
    -h, --help              Print help
    -V, --version           Print version

SETTINGS (KEY=VALUE):
    user=<NAME>             Remote user [default: root]
    port=<PORT>             SSH port [default: 22]
    password=<PW>           Authenticate with a password
    key_file=<PATH>         Authenticate with a private key
    timeout=<SECS>          Execution timeout, 0 for none [default: 3600]
    connect_timeout=<SECS>  Connect timeout [default: 180]
    attempts=<N>            Max connect attempts [default: unlimited]
    tag=<TAG>               Connection tag
    keepalive=<SECS>        Keepalive interval, 0 for none [default: 30]
    pty=<BOOL>              Request a pseudo-terminal

ENVIRONMENT VARIABLES:
    SHELL_EXEC_USER             Remote user (overrides config)
    SHELL_EXEC_PORT             SSH port (overrides config)
    SHELL_EXEC_CONNECT_TIMEOUT  Connect timeout (overrides config)
    SHELL_EXEC_LOG_LEVEL        Log level (overrides config)
    RUST_LOG                    Alternative log level setting

EXAMPLES:
    shell-exec db1 uptime
    shell-exec -v build01 make -j8 user=ci timeout=1800
    shell-exec -c /etc/shell-exec.json web3 systemctl restart nginx
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("shell-exec {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid setting value.
    InvalidValue(String, String),
    /// Argument that is not valid UTF-8.
    UnexpectedArgument(String),
    /// Required positional argument absent.
    Missing(&'static str),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for {}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
            Self::Missing(what) => write!(f, "missing {}", what),
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("shell-exec")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_endpoint_and_command() {
        let result = parse_args_from(args(&["db1", "uptime"])).unwrap();
        assert_eq!(result.endpoint.as_deref(), Some("db1"));
        assert_eq!(result.command_line(), "uptime");
        assert!(!result.verbose);
    }

    #[test]
    fn test_command_keeps_dash_options() {
        let result = parse_args_from(args(&["-v", "db1", "ls", "-la", "/srv"])).unwrap();
        assert!(result.verbose);
        assert_eq!(result.command_line(), "ls -la /srv");
    }

    #[test]
    fn test_overrides() {
        let result = parse_args_from(args(&[
            "db1", "make", "user=ci", "port=2222", "timeout=30", "attempts=3", "pty=yes",
        ]))
        .unwrap();
        assert_eq!(result.command_line(), "make");
        assert_eq!(result.user.as_deref(), Some("ci"));
        assert_eq!(result.port, Some(2222));
        assert_eq!(result.timeout, Some(30));
        assert_eq!(result.attempts, Some(3));
        assert!(result.pty);
    }

    #[test]
    fn test_unknown_key_is_command_word() {
        let result = parse_args_from(args(&["db1", "env", "FOO=bar"])).unwrap();
        assert_eq!(result.command_line(), "env FOO=bar");
    }

    #[test]
    fn test_invalid_override() {
        let result = parse_args_from(args(&["db1", "ls", "port=abc"]));
        assert!(matches!(result, Err(ArgsError::InvalidValue(ref k, _)) if k == "port"));
    }

    #[test]
    fn test_missing_positionals() {
        assert!(matches!(
            parse_args_from(args(&[])),
            Err(ArgsError::Missing("endpoint"))
        ));
        assert!(matches!(
            parse_args_from(args(&["db1"])),
            Err(ArgsError::Missing("command"))
        ));
    }

    #[test]
    fn test_help_and_version_need_no_positionals() {
        assert!(parse_args_from(args(&["-h"])).unwrap().help);
        assert!(parse_args_from(args(&["--version"])).unwrap().version);
    }

    #[test]
    fn test_config_and_log_level() {
        let result =
            parse_args_from(args(&["-c", "/etc/shell-exec.json", "-l", "debug", "h", "true"]))
                .unwrap();
        assert_eq!(result.config, Some(PathBuf::from("/etc/shell-exec.json")));
        assert_eq!(result.log_level, Some("debug".to_string()));
    }
}
