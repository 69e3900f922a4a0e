//! SSH login settings and the endpoint a transport reports

use crate::TransportError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Default remote agent location, relative to the login directory
pub const DEFAULT_AGENT_PATH: &str = "./server-agent";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a transport reaches the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// System `ssh` client subprocess
    Ssh,
    /// Agent started as a local child process
    LocalProcess,
    /// In-process byte stream
    InMemory,
}

/// Where a transport connects to, for logs and error messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// Port, 0 when not networked
    pub port: u16,
    /// Login name; empty when the transport has none
    pub username: String,
    /// Transport flavour
    pub kind: TransportKind,
}

impl Endpoint {
    /// Endpoint of a transport without a network peer
    pub fn local(kind: TransportKind) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            username: String::new(),
            kind,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::Ssh => write!(f, "{}@{}:{}", self.username, self.host, self.port),
            TransportKind::LocalProcess => write!(f, "local agent"),
            TransportKind::InMemory => write!(f, "in-memory stream"),
        }
    }
}

/// Login settings for [`SshTransport`](crate::SshTransport)
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// SSH server host name or address
    pub host: String,
    /// SSH server port
    pub port: u16,
    /// Login name
    pub username: String,
    /// Handed to `sshpass` through its environment, never on the command line
    pub password: Option<String>,
    /// Private key passed with `-i`
    pub key_path: Option<PathBuf>,
    /// Agent executable on the remote host
    pub agent_path: String,
    /// Extra `-o key=value` options
    pub options: BTreeMap<String, String>,
    /// TCP connect timeout, whole seconds
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_SSH_PORT,
            username: "root".to_string(),
            password: None,
            key_path: None,
            agent_path: DEFAULT_AGENT_PATH.to_string(),
            options: BTreeMap::new(),
            connect_timeout: 10,
        }
    }
}

impl SshConfig {
    /// `user@host`, as ssh expects its destination
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Endpoint these settings connect to
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            kind: TransportKind::Ssh,
        }
    }
}

/// Split `host[:port]` into its parts, defaulting to port 22.
///
/// Bracketed IPv6 literals (`[::1]:2222`) are accepted; a bare IPv6
/// address without brackets is taken as a host with the default port.
pub fn split_host_port(input: &str) -> Result<(String, u16), TransportError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TransportError::Configuration("Host is empty".to_string()));
    }
    let invalid = || TransportError::Configuration(format!("Invalid host: {}", input));

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail {
            "" => DEFAULT_SSH_PORT,
            _ => parse_port(tail.strip_prefix(':').ok_or_else(invalid)?)?,
        };
        return Ok((host.to_string(), port));
    }

    match input.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port)?)),
        _ => Ok((input.to_string(), DEFAULT_SSH_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16, TransportError> {
    port.parse()
        .map_err(|_| TransportError::Configuration(format!("Invalid port: {}", port)))
}
