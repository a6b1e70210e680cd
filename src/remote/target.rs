//! Remote endpoint description and connection tags.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::ExecError;
use crate::Result;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default principal when none is configured.
pub const DEFAULT_PRINCIPAL: &str = "root";

/// Default terminal type requested with a pty.
pub const DEFAULT_TERM: &str = "xterm";

static GLOBAL_TAG: RwLock<Option<String>> = RwLock::new(None);

/// How to authenticate to the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credential {
    /// Keys offered by a running ssh-agent.
    #[default]
    Agent,
    /// Password authentication.
    Password(String),
    /// Private key file, optionally encrypted.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// Options passed through to the transport as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Keepalive interval, `None` to disable.
    pub keepalive: Option<Duration>,
    /// Terminal type requested when a pty is allocated.
    pub term: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(30)),
            term: DEFAULT_TERM.to_string(),
        }
    }
}

/// A remote command target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub endpoint: String,
    pub principal: String,
    pub port: u16,
    pub credential: Credential,
    pub options: TransportOptions,
}

impl Target {
    /// Create a target for `endpoint` with default principal and port.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            principal: DEFAULT_PRINCIPAL.to_string(),
            port: DEFAULT_PORT,
            credential: Credential::default(),
            options: TransportOptions::default(),
        }
    }

    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn password(self, password: impl Into<String>) -> Self {
        self.credential(Credential::Password(password.into()))
    }

    pub fn options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject endpoints that cannot be connected to.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.endpoint.trim().is_empty() {
            "endpoint is empty"
        } else if self.endpoint.chars().any(char::is_whitespace) {
            "endpoint contains whitespace"
        } else if self.principal.is_empty() {
            "principal is empty"
        } else if self.port == 0 {
            "port is zero"
        } else {
            return Ok(());
        };
        Err(ExecError::InvalidTarget {
            principal: self.principal.clone(),
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        })
    }

    /// `host:port` address, bracketing bare IPv6 literals.
    pub fn address(&self) -> String {
        if self.endpoint.contains(':') && !self.endpoint.starts_with('[') {
            format!("[{}]:{}", self.endpoint, self.port)
        } else {
            format!("{}:{}", self.endpoint, self.port)
        }
    }

    pub(crate) fn connect_failure(&self, reason: Option<String>) -> ExecError {
        ExecError::ConnectFailure {
            principal: self.principal.clone(),
            endpoint: self.endpoint.clone(),
            reason,
        }
    }
}

/// Set the process-wide connection tag used when a caller gives none.
pub fn set_global_connection_tag(tag: Option<String>) {
    *GLOBAL_TAG
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = tag;
}

/// The process-wide connection tag, if one is set.
pub fn global_connection_tag() -> Option<String> {
    GLOBAL_TAG
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Resolve the pool tag: explicit tag, then the global tag, then the
/// calling thread's name (or id when unnamed).
pub fn resolve_tag(explicit: Option<&str>) -> String {
    if let Some(tag) = explicit {
        return tag.to_string();
    }
    if let Some(tag) = global_connection_tag() {
        return tag;
    }
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let target = Target::new("db1");
        assert_eq!(target.principal, "root");
        assert_eq!(target.port, 22);
        assert_eq!(target.credential, Credential::Agent);
        assert_eq!(target.address(), "db1:22");
        assert!(target.validate().is_ok());
    }

    #[test]
    fn test_empty_endpoint_is_invalid() {
        let err = Target::new("").validate().unwrap_err();
        assert!(matches!(err, ExecError::InvalidTarget { ref reason, .. } if reason == "endpoint is empty"));
        assert!(Target::new("a b").validate().is_err());
        assert!(Target::new("h").port(0).validate().is_err());
    }

    #[test]
    fn test_ipv6_address() {
        assert_eq!(Target::new("::1").port(2222).address(), "[::1]:2222");
    }

    #[test]
    fn test_explicit_tag_wins() {
        assert_eq!(resolve_tag(Some("batch")), "batch");
    }

    #[test]
    fn test_thread_name_fallback() {
        let tag = std::thread::Builder::new()
            .name("tag-probe".into())
            .spawn(|| resolve_tag(None))
            .unwrap()
            .join()
            .unwrap();
        // Another test may set a global tag concurrently; only assert the
        // fallback when none is set.
        if global_connection_tag().is_none() {
            assert_eq!(tag, "tag-probe");
        }
    }
}
