//! Session lifecycle: connect, handshake, forwards, teardown

use crate::error::PortgateError;
use crate::forward::{ForwardInfo, ForwardRegistry};
use crate::metrics::{ClientMetrics, CountedIo, TrafficSnapshot};
use crate::Result;
use portgate_proto::{
    read_message, write_message, HandshakeRequest, HandshakeResponse, Message, MuxConfig,
    MuxSession, PortConfig,
};
use portgate_ssh::{
    split_host_port, Connection, SshConfig, SshTransport, Transport, TransportError,
    DEFAULT_AGENT_PATH,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound for opening the handshake stream and reading the reply
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and settings for [`ConnectionManager::connect`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `host[:port]` of the SSH server
    pub host: String,
    /// Login name
    pub username: String,
    /// Password; key or agent authentication is used when absent
    pub password: Option<String>,
    /// Private key file
    pub key_path: Option<PathBuf>,
    /// Agent executable on the remote host
    pub agent_path: String,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: "root".to_string(),
            password: None,
            key_path: None,
            agent_path: DEFAULT_AGENT_PATH.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectOptions {
    /// Options for `username` at `host[:port]`
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Authenticate with a private key
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Use a different remote agent executable
    pub fn with_agent_path(mut self, agent_path: impl Into<String>) -> Self {
        self.agent_path = agent_path.into();
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// SSH settings for these options
    pub fn ssh_config(&self) -> Result<SshConfig> {
        let (host, port) = split_host_port(&self.host)?;
        Ok(SshConfig {
            host,
            port,
            username: self.username.clone(),
            password: self.password.clone().filter(|p| !p.is_empty()),
            key_path: self.key_path.clone(),
            agent_path: if self.agent_path.is_empty() {
                DEFAULT_AGENT_PATH.to_string()
            } else {
                self.agent_path.clone()
            },
            connect_timeout: self.connect_timeout.as_secs().max(1),
            ..Default::default()
        })
    }
}

/// Outcome of [`ConnectionManager::connect`]
#[derive(Debug, Clone, Serialize)]
pub struct ConnectResponse {
    /// Whether the session is up
    pub success: bool,
    /// Classified failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The server's handshake, including its allow-list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<HandshakeResponse>,
}

/// Outcome of [`ConnectionManager::test_connection`]
#[derive(Debug, Clone, Serialize)]
pub struct TestConnectionResult {
    /// Whether the host was reached and accepted the credentials
    pub success: bool,
    /// Classified failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identification string the SSH server sent, when it was seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    /// Time the check took, in milliseconds
    pub latency_ms: u64,
}

struct ActiveSession {
    id: Uuid,
    mux: Arc<MuxSession>,
    connection: Connection,
    handshake: HandshakeResponse,
}

struct Inner {
    /// Serializes connect, disconnect and forward setup
    session: Mutex<Option<ActiveSession>>,
    /// Snapshot of the live session for lock-free status checks
    live: StdMutex<Option<Arc<MuxSession>>>,
    forwards: ForwardRegistry,
    metrics: Arc<ClientMetrics>,
}

/// Owns the client's single session and its forwards.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// A manager with no session
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(None),
                live: StdMutex::new(None),
                forwards: ForwardRegistry::default(),
                metrics: Arc::new(ClientMetrics::new()),
            }),
        }
    }

    /// Connect over SSH, replacing any current session.
    ///
    /// Never fails outright; the response carries a classified message
    /// when the attempt did not succeed, and no partial session remains.
    pub async fn connect(&self, options: ConnectOptions) -> ConnectResponse {
        let result = match options.ssh_config() {
            Ok(config) => self.connect_with(Box::new(SshTransport::new(config))).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(handshake) => ConnectResponse {
                success: true,
                error: None,
                config: Some(handshake),
            },
            Err(e) => {
                warn!("Connect to {} failed: {}", options.host, e);
                ConnectResponse {
                    success: false,
                    error: Some(e.user_message()),
                    config: None,
                }
            }
        }
    }

    /// Establish a session over `transport` and run the handshake
    pub async fn connect_with(
        &self,
        mut transport: Box<dyn Transport>,
    ) -> Result<HandshakeResponse> {
        let mut session = self.inner.session.lock().await;
        self.teardown(&mut session).await;
        self.inner.metrics.reset();

        info!("Connecting to {}", transport.endpoint());

        let mut connection = transport.connect().await?;
        let io = connection
            .take_io()
            .ok_or_else(|| TransportError::Connection("Transport produced no stream".to_string()))?;
        let counted = CountedIo::new(io, Arc::clone(&self.inner.metrics));
        let mux = Arc::new(MuxSession::client(counted, MuxConfig::default()));

        let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mux)).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                mux.close();
                let e = explain_failure(&connection, e);
                let _ = connection.close().await;
                return Err(e);
            }
            Err(_) => {
                mux.close();
                let _ = connection.close().await;
                return Err(TransportError::Timeout.into());
            }
        };

        let id = Uuid::new_v4();
        info!(
            session_id = %id,
            "Connected, server version {} allows {} targets",
            handshake.version,
            handshake.allowed_ports.len()
        );

        *self.lock_live() = Some(Arc::clone(&mux));
        tokio::spawn(watch_session(
            Arc::downgrade(&self.inner),
            id,
            mux.close_signal(),
        ));
        *session = Some(ActiveSession {
            id,
            mux,
            connection,
            handshake: handshake.clone(),
        });
        Ok(handshake)
    }

    /// Close every forward, then the session, then the transport.
    ///
    /// Safe to call at any time; always succeeds.
    pub async fn disconnect(&self) -> bool {
        let mut session = self.inner.session.lock().await;
        self.teardown(&mut session).await;
        true
    }

    async fn teardown(&self, session: &mut Option<ActiveSession>) {
        self.inner.forwards.stop_all().await;
        *self.lock_live() = None;

        if let Some(mut active) = session.take() {
            active.mux.close();
            if let Err(e) = active.connection.close().await {
                warn!("Failed to close transport: {}", e);
            }
            info!(session_id = %active.id, "Disconnected");
        }
    }

    /// Whether a session is up. Never waits on the network.
    pub fn status(&self) -> bool {
        self.lock_live()
            .as_ref()
            .map(|mux| !mux.is_closed())
            .unwrap_or(false)
    }

    /// Bytes moved over the transport since the last connect
    pub fn metrics(&self) -> TrafficSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Allow-list advertised by the current session's server
    pub async fn allowed_ports(&self) -> Option<Vec<PortConfig>> {
        let session = self.inner.session.lock().await;
        session
            .as_ref()
            .map(|active| active.handshake.allowed_ports.clone())
    }

    /// Listen on `local` and forward each accepted connection to `target`.
    ///
    /// `local` may name an ephemeral port (`127.0.0.1:0`); the returned
    /// address is the one actually bound and is the key for
    /// [`stop_forward`](Self::stop_forward).
    pub async fn start_forward(&self, local: &str, target: &str) -> Result<SocketAddr> {
        let session = self.inner.session.lock().await;
        let active = session.as_ref().ok_or(PortgateError::NotConnected)?;
        self.inner
            .forwards
            .start(Arc::clone(&active.mux), local, target)
            .await
    }

    /// Stop the forward bound to `local`; false if there is none
    pub async fn stop_forward(&self, local: &str) -> bool {
        self.inner.forwards.stop(local).await
    }

    /// Active forwards, ordered by local address
    pub fn forwards(&self) -> Vec<ForwardInfo> {
        self.inner.forwards.list()
    }

    /// Resolves when the current session ends; immediately if there is none
    pub async fn closed(&self) {
        let mux = self.lock_live().clone();
        if let Some(mux) = mux {
            mux.closed().await;
        }
    }

    /// Check that the SSH server is reachable and accepts the credentials,
    /// without starting the agent or touching the current session
    pub async fn test_connection(&self, options: ConnectOptions) -> TestConnectionResult {
        match options.ssh_config() {
            Ok(config) => check_transport(&mut SshTransport::new(config)).await,
            Err(e) => TestConnectionResult {
                success: false,
                error: Some(e.user_message()),
                banner: None,
                latency_ms: 0,
            },
        }
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, Option<Arc<MuxSession>>> {
        self.inner.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn check_transport(transport: &mut dyn Transport) -> TestConnectionResult {
    let start = Instant::now();
    let result = transport.test_connection().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(banner) => TestConnectionResult {
            success: true,
            error: None,
            banner,
            latency_ms,
        },
        Err(e) => TestConnectionResult {
            success: false,
            error: Some(PortgateError::from(e).user_message()),
            banner: None,
            latency_ms,
        },
    }
}

async fn handshake(mux: &MuxSession) -> Result<HandshakeResponse> {
    let mut stream = mux.open_stream().await?;
    write_message(&mut stream, &Message::Handshake(HandshakeRequest::current())).await?;
    let response: HandshakeResponse = read_message(&mut stream).await?;

    if let Some(error) = response.error.filter(|e| !e.is_empty()) {
        return Err(PortgateError::Handshake(error));
    }
    debug!("Handshake complete");
    Ok(HandshakeResponse {
        error: None,
        ..response
    })
}

/// Prefer what the transport process printed over a bare protocol error
fn explain_failure(connection: &Connection, error: PortgateError) -> PortgateError {
    match (&error, connection.diagnostics()) {
        (PortgateError::Protocol(_), Some(diagnostics)) => {
            TransportError::from_ssh_diagnostics(&diagnostics).into()
        }
        _ => error,
    }
}

/// Tear everything down when the transport dies underneath us
async fn watch_session(inner: Weak<Inner>, id: Uuid, closed: CancellationToken) {
    closed.cancelled().await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let manager = ConnectionManager { inner };
    let mut session = manager.inner.session.lock().await;
    if session.as_ref().map(|active| active.id) == Some(id) {
        warn!(session_id = %id, "Session lost");
        manager.teardown(&mut session).await;
    }
}
