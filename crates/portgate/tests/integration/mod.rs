//! Harness wiring a client `ConnectionManager` to an in-process agent
//!
//! The agent's `Server` runs over one end of an in-memory duplex stream and
//! the client connects through `DuplexTransport` on the other, so the whole
//! protocol stack runs without SSH.

use anyhow::{Context, Result};
use portgate::ConnectionManager;
use portgate_agent::{Server, ServerConfig, ServerMetrics};
use portgate_proto::PortConfig;
use portgate_ssh::DuplexTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Client and agent sharing one in-memory transport
pub struct Gateway {
    /// Client side
    pub manager: ConnectionManager,
    /// Agent counters
    pub agent_metrics: Arc<ServerMetrics>,
    /// The agent's accept loop
    pub agent: JoinHandle<()>,
}

impl Gateway {
    /// Start an agent with `config` and connect a fresh client to it
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let manager = ConnectionManager::new();
        let (agent_metrics, agent) = attach(&manager, config).await?;
        Ok(Self {
            manager,
            agent_metrics,
            agent,
        })
    }

    /// Start an agent allowing exactly `targets`
    pub async fn allowing(targets: &[&str]) -> Result<Self> {
        Self::start(allow(targets)).await
    }
}

/// Start an agent and connect `manager` to it, replacing its session
pub async fn attach(
    manager: &ConnectionManager,
    config: ServerConfig,
) -> Result<(Arc<ServerMetrics>, JoinHandle<()>)> {
    let (client_io, agent_io) = tokio::io::duplex(1024 * 1024);
    let metrics = Arc::new(ServerMetrics::new());
    let agent = tokio::spawn(Server::over_io(agent_io, config, Arc::clone(&metrics)).serve());

    manager
        .connect_with(Box::new(DuplexTransport::new(client_io)))
        .await
        .context("handshake with in-process agent")?;
    Ok((metrics, agent))
}

/// Agent config allowing exactly `targets`
pub fn allow(targets: &[&str]) -> ServerConfig {
    ServerConfig {
        allowed_ports: targets
            .iter()
            .enumerate()
            .map(|(i, target)| PortConfig::new(format!("target-{}", i), *target))
            .collect(),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// TCP server echoing each connection until the peer half-closes
pub async fn echo_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    Ok(addr)
}

/// Send `payload`, half-close and collect everything that comes back
pub async fn exchange(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let mut conn = TcpStream::connect(addr).await?;
    conn.write_all(payload).await?;
    conn.shutdown().await?;
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), conn.read_to_end(&mut reply))
        .await
        .context("echo reply timed out")??;
    Ok(reply)
}

/// Read from `conn` until it closes, treating a reset as a close
pub async fn read_until_closed(conn: &mut TcpStream) -> Result<Vec<u8>> {
    let mut received = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(10), conn.read_to_end(&mut received))
        .await
        .context("connection was not closed")?;
    match read {
        Ok(_) => Ok(received),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(received),
        Err(e) => Err(e.into()),
    }
}

/// Poll `condition` until it holds
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {}", what))
}
