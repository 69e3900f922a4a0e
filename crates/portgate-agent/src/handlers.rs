//! Handshake and connect request handlers

use crate::error::{AgentError, Result};
use crate::proxy;
use crate::server::ServerState;
use portgate_proto::{
    write_message, ConnectRequest, ConnectResponse, HandshakeRequest, HandshakeResponse, MuxStream,
    PROTOCOL_VERSION,
};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Answer a handshake with the allow-list, then close the stream
pub async fn handle_handshake(
    state: &ServerState,
    mut stream: MuxStream,
    request: HandshakeRequest,
) -> Result<()> {
    if request.version != PROTOCOL_VERSION {
        warn!(
            "Client protocol version {} differs from {}",
            request.version, PROTOCOL_VERSION
        );
    }

    let response = HandshakeResponse {
        version: PROTOCOL_VERSION.to_string(),
        allowed_ports: state.access.entries().to_vec(),
        error: None,
    };
    write_message(&mut stream, &response).await?;
    stream.shutdown().await?;

    debug!(
        stream_id = stream.stream_id(),
        "Handshake complete, advertised {} targets",
        response.allowed_ports.len()
    );
    Ok(())
}

/// Check the target, dial it and forward bytes until both sides finish
pub async fn handle_connect(
    state: &ServerState,
    mut stream: MuxStream,
    request: ConnectRequest,
) -> Result<()> {
    let target = request.target;

    if !state.access.is_allowed(&target) {
        let denial = AgentError::TargetNotAllowed(target.clone());
        write_message(&mut stream, &ConnectResponse::failed(denial.to_string())).await?;
        warn!("Denied access to {}", target);
        state.metrics.denied();
        return Ok(());
    }

    let target_conn = match dial(&target, state.config.connect_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            write_message(&mut stream, &ConnectResponse::failed(e.to_string())).await?;
            warn!("Failed to dial {}: {}", target, e);
            state.metrics.connect_error();
            return Ok(());
        }
    };

    write_message(&mut stream, &ConnectResponse::ok()).await?;
    debug!(stream_id = stream.stream_id(), "Forwarding to {}", target);

    let transferred = proxy::pump(stream, target_conn, &state.buffers).await;
    state.metrics.add_bytes(transferred.total());

    info!(
        "Closed connection to {} ({} bytes up, {} bytes down)",
        target, transferred.upstream, transferred.downstream
    );
    Ok(())
}

/// Connect to `target`, reporting a timeout like any other dial failure
async fn dial(target: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(conn)) => {
            let _ = conn.set_nodelay(true);
            Ok(conn)
        }
        Ok(Err(e)) => Err(AgentError::DialFailed(e)),
        Err(_) => Err(AgentError::DialFailed(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connection to {} timed out after {:?}", target, timeout),
        ))),
    }
}
