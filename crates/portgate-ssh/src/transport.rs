//! Ways of reaching the agent

use crate::config::{Endpoint, SshConfig, TransportKind};
use crate::connection::DuplexIo;
use crate::{Connection, TransportError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

const CHECK_COMMAND: &str = "echo connection_test";
const CHECK_REPLY: &str = "connection_test";
const BANNER_MARKER: &str = "Remote protocol version ";

/// Source of the single duplex byte stream a session runs over
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the stream, starting the remote agent if needed
    async fn connect(&mut self) -> Result<Connection, TransportError>;

    /// Check that the remote side is reachable and accepts our credentials,
    /// without starting the agent.
    ///
    /// Returns the server's identification banner when the transport has one.
    async fn test_connection(&mut self) -> Result<Option<String>, TransportError>;

    /// Where this transport connects to
    fn endpoint(&self) -> Endpoint;
}

/// Runs the remote agent through the system `ssh` client; its stdio is the stream
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    /// Transport for the given login settings
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn agent_command(&self) -> String {
        format!("{} --stdio", self.config.agent_path)
    }

    /// `ssh` arguments that run `remote_command` on the server
    fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let config = &self.config;
        let mut options = vec![
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("ConnectTimeout={}", config.connect_timeout),
        ];
        // sshpass answers the password prompt, so prompts must stay enabled
        if config.password.is_none() {
            options.push("BatchMode=yes".to_string());
        }
        options.extend(config.options.iter().map(|(k, v)| format!("{}={}", k, v)));

        let mut args = vec!["-T".to_string(), "-p".to_string(), config.port.to_string()];
        for option in options {
            args.push("-o".to_string());
            args.push(option);
        }
        if let Some(key) = &config.key_path {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        args.push(config.destination());
        args.push(remote_command.to_string());
        args
    }

    fn program(&self) -> &'static str {
        if self.config.password.is_some() {
            "sshpass"
        } else {
            "ssh"
        }
    }

    fn command(&self, remote_command: &str, verbose: bool) -> Command {
        let mut command = Command::new(self.program());
        if let Some(password) = &self.config.password {
            command.arg("-e").arg("ssh").env("SSHPASS", password);
        }
        if verbose {
            command.arg("-v");
        }
        command
            .args(self.ssh_args(remote_command))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, e: std::io::Error) -> TransportError {
        TransportError::Connection(format!("Failed to start {}: {}", self.program(), e))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self) -> Result<Connection, TransportError> {
        info!("Launching agent on {}", self.config.endpoint());
        let remote = self.agent_command();
        debug!("ssh {}", self.ssh_args(&remote).join(" "));

        let child = self.command(&remote, false).spawn().map_err(|e| self.spawn_error(e))?;
        Connection::from_process(child)
    }

    async fn test_connection(&mut self) -> Result<Option<String>, TransportError> {
        debug!("Testing connection to {}", self.config.endpoint());

        // -v makes ssh log the server's identification line
        let mut command = self.command(CHECK_COMMAND, true);
        command.stdin(Stdio::null());
        let child = command.spawn().map_err(|e| self.spawn_error(e))?;

        // ConnectTimeout only covers the TCP connect, not authentication
        let limit = Duration::from_secs(self.config.connect_timeout.saturating_mul(2).max(1));
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout)??;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let (banner, diagnostics) = split_verbose_output(&stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && stdout.contains(CHECK_REPLY) {
            return Ok(banner);
        }

        match diagnostics.trim() {
            "" => Err(TransportError::ProcessExited {
                code: output.status.code().unwrap_or(-1),
                message: "Connection test failed".to_string(),
            }),
            diagnostics => Err(TransportError::from_ssh_diagnostics(diagnostics)),
        }
    }

    fn endpoint(&self) -> Endpoint {
        self.config.endpoint()
    }
}

/// Separate `ssh -v` debug lines from real diagnostics, picking the
/// server banner out of the former.
///
/// OpenSSH logs the identification string as
/// `debug1: Remote protocol version 2.0, remote software version OpenSSH_9.6`,
/// which is rebuilt here into its wire form `SSH-2.0-OpenSSH_9.6`.
fn split_verbose_output(stderr: &str) -> (Option<String>, String) {
    let mut banner = None;
    let mut diagnostics = Vec::new();

    for line in stderr.lines() {
        let Some(debug) = line.strip_prefix("debug") else {
            diagnostics.push(line);
            continue;
        };
        if banner.is_some() {
            continue;
        }
        let Some((_, rest)) = debug.split_once(BANNER_MARKER) else {
            continue;
        };
        if let Some((protocol, software)) = rest.split_once(", remote software version ") {
            banner = Some(format!("SSH-{}-{}", protocol.trim(), software.trim()));
        }
    }

    (banner, diagnostics.join("\n"))
}

/// Starts the agent as a local child process
pub struct LocalTransport {
    agent_path: PathBuf,
    extra_args: Vec<String>,
}

impl LocalTransport {
    /// Transport running `agent_path --stdio`
    pub fn new(agent_path: impl Into<PathBuf>) -> Self {
        Self {
            agent_path: agent_path.into(),
            extra_args: Vec::new(),
        }
    }

    /// Append an argument to the agent command line
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&mut self) -> Result<Connection, TransportError> {
        debug!("Starting local agent: {}", self.agent_path.display());

        let child = Command::new(&self.agent_path)
            .arg("--stdio")
            .args(&self.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::Connection(format!(
                    "Failed to start agent {}: {}",
                    self.agent_path.display(),
                    e
                ))
            })?;

        Connection::from_process(child)
    }

    async fn test_connection(&mut self) -> Result<Option<String>, TransportError> {
        let path = self.agent_path.display();
        let metadata = tokio::fs::metadata(&self.agent_path)
            .await
            .map_err(|e| TransportError::Connection(format!("Agent {} not found: {}", path, e)))?;
        if !metadata.is_file() {
            return Err(TransportError::Configuration(format!(
                "Agent {} is not a file",
                path
            )));
        }
        Ok(None)
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::local(TransportKind::LocalProcess)
    }
}

/// Hands out one already-connected in-process stream
pub struct DuplexTransport {
    io: std::sync::Mutex<Option<Box<dyn DuplexIo>>>,
}

impl DuplexTransport {
    /// Wrap `io`; the first `connect` consumes it
    pub fn new(io: impl DuplexIo + 'static) -> Self {
        Self {
            io: std::sync::Mutex::new(Some(Box::new(io))),
        }
    }

    fn used() -> TransportError {
        TransportError::Connection("In-memory stream already used".to_string())
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(&mut self) -> Result<Connection, TransportError> {
        let io = self
            .io
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(Self::used)?;
        Ok(Connection::from_io(io))
    }

    async fn test_connection(&mut self) -> Result<Option<String>, TransportError> {
        match self.io.get_mut().unwrap_or_else(|e| e.into_inner()) {
            Some(_) => Ok(None),
            None => Err(Self::used()),
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::local(TransportKind::InMemory)
    }
}
