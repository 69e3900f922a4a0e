//! Local listeners and the per-connection forwarding engine

use crate::error::PortgateError;
use crate::Result;
use portgate_proto::{read_message, write_message, ConnectRequest, Message, MuxSession};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One active local listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    /// Address the listener is bound to
    pub local_addr: SocketAddr,
    /// Remote target its connections are forwarded to
    pub target: String,
}

struct ForwardHandle {
    target: String,
    cancel: CancellationToken,
    listener_closed: oneshot::Receiver<()>,
    _stop_on_drop: DropGuard,
}

/// Listeners registered by this process, keyed by their bound address
#[derive(Default)]
pub(crate) struct ForwardRegistry {
    listeners: Mutex<HashMap<SocketAddr, ForwardHandle>>,
}

impl ForwardRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, ForwardHandle>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind `requested` and forward every accepted connection to `target`
    pub(crate) async fn start(
        &self,
        mux: Arc<MuxSession>,
        requested: &str,
        target: &str,
    ) -> Result<SocketAddr> {
        let requested_addr = parse_local_addr(requested)?;
        if requested_addr.port() != 0 && self.lock().contains_key(&requested_addr) {
            return Err(PortgateError::AlreadyInUse(requested_addr.to_string()));
        }

        let listener = TcpListener::bind(requested_addr)
            .await
            .map_err(|source| PortgateError::Bind {
                addr: requested_addr.to_string(),
                source,
            })?;
        let bound = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = oneshot::channel();
        {
            let mut listeners = self.lock();
            if listeners.contains_key(&bound) {
                return Err(PortgateError::AlreadyInUse(bound.to_string()));
            }
            listeners.insert(
                bound,
                ForwardHandle {
                    target: target.to_string(),
                    cancel: cancel.clone(),
                    listener_closed: closed_rx,
                    _stop_on_drop: cancel.clone().drop_guard(),
                },
            );
        }

        info!("Forwarding {} -> {}", bound, target);
        tokio::spawn(accept_loop(listener, mux, target.to_string(), cancel, closed_tx));
        Ok(bound)
    }

    /// Close and unregister the listener bound to `local`.
    ///
    /// Returns once the port is released. Connections already being
    /// forwarded keep running until either end closes.
    pub(crate) async fn stop(&self, local: &str) -> bool {
        let Ok(addr) = parse_local_addr(local) else {
            return false;
        };
        let handle = self.lock().remove(&addr);
        match handle {
            Some(handle) => {
                close_listener(addr, handle).await;
                true
            }
            None => false,
        }
    }

    /// Close every listener
    pub(crate) async fn stop_all(&self) {
        let handles: Vec<_> = self.lock().drain().collect();
        for (addr, handle) in handles {
            close_listener(addr, handle).await;
        }
    }

    pub(crate) fn list(&self) -> Vec<ForwardInfo> {
        let mut forwards: Vec<_> = self
            .lock()
            .iter()
            .map(|(addr, handle)| ForwardInfo {
                local_addr: *addr,
                target: handle.target.clone(),
            })
            .collect();
        forwards.sort_by_key(|forward| forward.local_addr);
        forwards
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

async fn close_listener(addr: SocketAddr, handle: ForwardHandle) {
    handle.cancel.cancel();
    // An accept loop that already exited dropped its sender
    let _ = handle.listener_closed.await;
    info!("Stopped forwarding {} -> {}", addr, handle.target);
}

/// Parse a local listen address.
///
/// Accepts `port`, `:port` and `host:port`; a missing host means loopback
/// and port 0 asks for an ephemeral port.
pub fn parse_local_addr(input: &str) -> Result<SocketAddr> {
    let input = input.trim();
    let invalid = || PortgateError::InvalidAddress(input.to_string());

    let port_only = input.strip_prefix(':').unwrap_or(input);
    if let Ok(port) = port_only.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }

    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    match input.rsplit_once(':') {
        Some(("localhost", port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        }
        _ => Err(invalid()),
    }
}

/// Where an accept loop takes its connections from
trait Incoming: Send + Sync + 'static {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>>;
}

impl Incoming for TcpListener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

/// Accept until cancelled. A failed accept never ends the loop: the
/// listener stays registered, so it has to keep serving.
async fn accept_loop<L: Incoming>(
    listener: L,
    mux: Arc<MuxSession>,
    target: String,
    cancel: CancellationToken,
    listener_closed: oneshot::Sender<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        while connections.try_join_next().is_some() {}

        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = std::future::poll_fn(|cx| listener.poll_accept(cx)) => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Typically EMFILE or a connection reset before it was accepted
                    warn!("Accept failed for {}: {}", target, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            },
        };

        debug!("Accepted {} for {}", peer, target);
        let mux = Arc::clone(&mux);
        let target = target.clone();
        connections.spawn(async move {
            if let Err(e) = forward_connection(&mux, conn, &target).await {
                warn!("Forward from {} to {} failed: {}", peer, target, e);
            }
        });
    }

    drop(listener);
    let _ = listener_closed.send(());

    while connections.join_next().await.is_some() {}
}

/// Forward one local connection through a new logical stream
pub async fn forward_connection(mux: &MuxSession, local: TcpStream, target: &str) -> Result<()> {
    let _ = local.set_nodelay(true);
    let mut stream = mux.open_stream().await?;

    let request = Message::Connect(ConnectRequest {
        target: target.to_string(),
    });
    write_message(&mut stream, &request).await?;

    let response: portgate_proto::ConnectResponse = read_message(&mut stream).await?;
    if !response.success {
        return Err(PortgateError::ConnectRejected {
            target: target.to_string(),
            reason: response.error.unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    let (sent, received) = pump(local, stream).await;
    debug!("Closed forward to {} ({} bytes sent, {} bytes received)", target, sent, received);
    Ok(())
}

/// Copy both ways until both directions finish, half-closing each writer
/// once its reader reaches end of input. Copy errors just end a direction.
async fn pump<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let n = tokio::io::copy(&mut a_read, &mut b_write).await.unwrap_or(0);
        let _ = b_write.shutdown().await;
        n
    };
    let b_to_a = async {
        let n = tokio::io::copy(&mut b_read, &mut a_write).await.unwrap_or(0);
        let _ = a_write.shutdown().await;
        n
    };

    tokio::join!(a_to_b, b_to_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_local_addr() {
        let loopback = |port| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        assert_eq!(parse_local_addr("8080").unwrap(), loopback(8080));
        assert_eq!(parse_local_addr(":8080").unwrap(), loopback(8080));
        assert_eq!(parse_local_addr("localhost:8080").unwrap(), loopback(8080));
        assert_eq!(parse_local_addr("0").unwrap(), loopback(0));
        assert_eq!(
            parse_local_addr("0.0.0.0:9000").unwrap(),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_local_addr("[::1]:9000").unwrap(),
            "[::1]:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_local_addr("").is_err());
        assert!(parse_local_addr("example.com:80").is_err());
        assert!(parse_local_addr("127.0.0.1:99999").is_err());
    }

    proptest! {
        #[test]
        fn prop_port_forms_agree(port in any::<u16>()) {
            let bare = parse_local_addr(&port.to_string()).unwrap();
            prop_assert_eq!(bare, parse_local_addr(&format!(":{}", port)).unwrap());
            prop_assert_eq!(bare, parse_local_addr(&format!("127.0.0.1:{}", port)).unwrap());
        }
    }

    #[tokio::test]
    async fn test_pump_half_closes_each_way() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);
        let pumping = tokio::spawn(pump(a, b));

        a_peer.write_all(b"request").await.unwrap();
        a_peer.shutdown().await.unwrap();

        let mut got = Vec::new();
        b_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");

        // The other direction is still open after the half-close
        b_peer.write_all(b"response").await.unwrap();
        b_peer.shutdown().await.unwrap();

        let mut got = Vec::new();
        a_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"response");

        assert_eq!(pumping.await.unwrap(), (7, 8));
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates_and_stops() {
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let mux = Arc::new(MuxSession::client(client_io, Default::default()));
        let registry = ForwardRegistry::default();

        let bound = registry
            .start(Arc::clone(&mux), "127.0.0.1:0", "10.0.0.5:80")
            .await
            .unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.list(),
            vec![ForwardInfo {
                local_addr: bound,
                target: "10.0.0.5:80".to_string(),
            }]
        );

        let err = registry
            .start(Arc::clone(&mux), &bound.to_string(), "10.0.0.5:81")
            .await
            .unwrap_err();
        assert!(matches!(err, PortgateError::AlreadyInUse(_)));

        // Ephemeral requests never collide
        let second = registry
            .start(Arc::clone(&mux), "127.0.0.1:0", "10.0.0.5:80")
            .await
            .unwrap();
        assert_ne!(second, bound);

        assert!(registry.stop(&bound.to_string()).await);
        assert!(!registry.stop(&bound.to_string()).await);
        assert!(!registry.stop("not an address").await);
        assert!(TcpStream::connect(bound).await.is_err());

        registry.stop_all().await;
        assert_eq!(registry.len(), 0);
        assert!(TcpStream::connect(second).await.is_err());
    }

    /// Fails the first `failures` accepts, then hands out real connections
    struct FlakyListener {
        inner: TcpListener,
        failures: std::sync::atomic::AtomicUsize,
    }

    impl Incoming for FlakyListener {
        fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
            use std::sync::atomic::Ordering;
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Poll::Ready(Err(io::Error::from_raw_os_error(24)));
            }
            self.inner.poll_accept(cx)
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_listener() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mux = Arc::new(MuxSession::client(client_io, Default::default()));
        let remote = MuxSession::server(server_io, Default::default());

        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let listener = FlakyListener {
            inner,
            failures: 3.into(),
        };
        let cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = oneshot::channel();
        let accepting = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&mux),
            "10.0.0.5:80".to_string(),
            cancel.clone(),
            closed_tx,
        ));

        let _local = TcpStream::connect(addr).await.unwrap();
        let mut stream = tokio::time::timeout(Duration::from_secs(5), remote.accept_stream())
            .await
            .expect("connection was never forwarded")
            .unwrap();
        let request: Message = read_message(&mut stream).await.unwrap();
        assert_eq!(
            request,
            Message::Connect(ConnectRequest {
                target: "10.0.0.5:80".to_string(),
            })
        );

        cancel.cancel();
        closed_rx.await.unwrap();
        let refusal = portgate_proto::ConnectResponse {
            success: false,
            error: Some("not allowed".to_string()),
        };
        write_message(&mut stream, &refusal).await.unwrap();
        accepting.await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
