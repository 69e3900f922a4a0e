//! Stream multiplexing over one duplex transport
//!
//! A [`MuxSession`] turns a single ordered byte stream into any number of
//! independent logical streams. Each [`MuxStream`] is a plain
//! `AsyncRead + AsyncWrite` handle; behind it two pump tasks translate
//! between the handle and frames on the shared transport:
//!
//! - outbound: bytes written to the handle become DATA frames, gated by the
//!   peer's credit window; EOF on the handle (shutdown or drop) becomes FIN.
//! - inbound: DATA frames are written into the handle's read buffer and
//!   their size is granted back to the peer as window credit once the buffer
//!   accepted them; FIN shuts the handle's read side.
//!
//! Client-opened streams use odd ids, server-opened streams even ids.

use crate::codec::{FrameReader, FrameWriter};
use crate::{Frame, ProtocolError};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest DATA payload emitted in one frame
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Which side of the session this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens streams with odd ids
    Client,
    /// Opens streams with even ids
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether `stream_id` may be opened by the peer of this role
    fn is_peer_stream(self, stream_id: u32) -> bool {
        match self {
            Self::Client => stream_id != 0 && stream_id % 2 == 0,
            Self::Server => stream_id % 2 == 1,
        }
    }
}

/// Multiplexer settings
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Send periodic keepalive pings
    pub enable_keepalive: bool,
    /// Interval between keepalive pings; a ping still unanswered when the
    /// next one is due closes the session
    pub keepalive_interval: Duration,
    /// Per-stream flow-control window in bytes
    pub max_stream_window: u32,
    /// How long `open_stream` waits for the peer to acknowledge a new stream
    pub stream_open_timeout: Duration,
    /// How long a stream that finished sending waits for the peer's FIN
    pub stream_close_timeout: Duration,
    /// Streams opened by the peer but not yet accepted
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enable_keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            max_stream_window: 1024 * 1024,
            stream_open_timeout: Duration::from_secs(30),
            stream_close_timeout: Duration::from_secs(300),
            accept_backlog: 256,
        }
    }
}

/// What the read loop hands to a stream's inbound pump
#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    Fin,
}

/// Bookkeeping for one live stream
struct StreamEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    send_credit: Arc<Semaphore>,
    reset: CancellationToken,
    opened: Option<oneshot::Sender<()>>,
}

struct Shared {
    role: Role,
    config: MuxConfig,
    next_stream_id: AtomicU32,
    /// Nonce of the newest ping the peer has answered
    ping_answered: AtomicU32,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
}

/// A multiplexed session over one duplex transport
pub struct MuxSession {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

/// One logical stream of a [`MuxSession`]
#[derive(Debug)]
pub struct MuxStream {
    stream_id: u32,
    io: DuplexStream,
}

impl MuxSession {
    /// Start a session playing the client role
    pub fn client<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Client, config)
    }

    /// Start a session playing the server role
    pub fn server<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(io, Role::Server, config)
    }

    /// Start a session over `io`. Must be called within a Tokio runtime.
    pub fn new<T>(io: T, role: Role, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            ping_answered: AtomicU32::new(0),
            streams: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(write_loop(writer, outbound_rx, shared.shutdown.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&shared), accept_tx));
        if shared.config.enable_keepalive {
            tokio::spawn(keepalive_loop(Arc::clone(&shared)));
        }

        debug!(role = ?role, "Multiplexed session started");
        Self {
            shared,
            incoming: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a new logical stream and wait for the peer to acknowledge it
    pub async fn open_stream(&self) -> Result<MuxStream, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::SessionClosed);
        }

        let stream_id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let (opened_tx, opened_rx) = oneshot::channel();
        let stream = Shared::register_stream(&self.shared, stream_id, Some(opened_tx))?;
        self.shared.send_frame(Frame::syn(stream_id))?;

        match tokio::time::timeout(self.shared.config.stream_open_timeout, opened_rx).await {
            Ok(Ok(())) => {
                trace!(stream_id, "Stream opened");
                Ok(stream)
            }
            // The entry was dropped: either the peer reset the stream or the session died
            Ok(Err(_)) => {
                if self.is_closed() {
                    Err(ProtocolError::SessionClosed)
                } else {
                    Err(ProtocolError::StreamReset(stream_id))
                }
            }
            Err(_) => {
                warn!(stream_id, "Peer did not acknowledge stream in time");
                self.shared.reset_stream(stream_id);
                Err(ProtocolError::Timeout("stream open"))
            }
        }
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<MuxStream, ProtocolError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or(ProtocolError::SessionClosed),
            _ = self.shared.shutdown.cancelled() => Err(ProtocolError::SessionClosed),
        }
    }

    /// Close the session; every stream and pending open/accept fails promptly
    pub fn close(&self) {
        if !self.shared.shutdown.is_cancelled() {
            debug!(role = ?self.shared.role, "Closing multiplexed session");
            self.shared.shutdown.cancel();
        }
    }

    /// Whether the session has been closed locally or lost its transport
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// A token cancelled when the session closes; cancelling it has no effect
    /// on the session
    pub fn close_signal(&self) -> CancellationToken {
        self.shared.shutdown.child_token()
    }

    /// Number of live logical streams
    pub fn stream_count(&self) -> usize {
        self.shared.lock_streams().len()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn lock_streams(&self) -> MutexGuard<'_, HashMap<u32, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::SessionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| ProtocolError::SessionClosed)
    }

    /// Create the entry and pump task for `stream_id`, returning its handle
    fn register_stream(
        shared: &Arc<Shared>,
        stream_id: u32,
        opened: Option<oneshot::Sender<()>>,
    ) -> Result<MuxStream, ProtocolError> {
        let window = shared.config.max_stream_window.max(1);
        let (user_io, mux_io) = tokio::io::duplex(window as usize);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let send_credit = Arc::new(Semaphore::new(window as usize));
        let reset = shared.shutdown.child_token();

        {
            let mut streams = shared.lock_streams();
            if streams.contains_key(&stream_id) {
                return Err(ProtocolError::InvalidFrame);
            }
            streams.insert(
                stream_id,
                StreamEntry {
                    inbound: inbound_tx,
                    send_credit: Arc::clone(&send_credit),
                    reset: reset.clone(),
                    opened,
                },
            );
        }

        tokio::spawn(drive_stream(
            Arc::clone(shared),
            stream_id,
            mux_io,
            inbound_rx,
            send_credit,
            reset,
        ));

        Ok(MuxStream {
            stream_id,
            io: user_io,
        })
    }

    /// Abort a stream locally and tell the peer
    fn reset_stream(&self, stream_id: u32) {
        if let Some(entry) = self.lock_streams().remove(&stream_id) {
            entry.reset.cancel();
            entry.send_credit.close();
        }
        let _ = self.send_frame(Frame::rst(stream_id));
    }

    fn remove_stream(&self, stream_id: u32) {
        if let Some(entry) = self.lock_streams().remove(&stream_id) {
            entry.send_credit.close();
        }
    }

    /// Route one frame read from the transport
    fn dispatch(
        shared: &Arc<Shared>,
        frame: Frame,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> Result<(), ProtocolError> {
        if frame.is_ping() {
            if frame.is_ack() {
                shared
                    .ping_answered
                    .store(frame.ping_nonce()?, Ordering::Release);
            } else {
                shared.send_frame(Frame::pong(&frame))?;
            }
            return Ok(());
        }

        let stream_id = frame.stream_id;

        if frame.is_syn() {
            return Self::accept_syn(shared, stream_id, accept_tx);
        }

        if frame.is_rst() {
            if let Some(entry) = shared.lock_streams().remove(&stream_id) {
                trace!(stream_id, "Stream reset by peer");
                entry.reset.cancel();
                entry.send_credit.close();
            }
            return Ok(());
        }

        let delivered = match shared.lock_streams().get_mut(&stream_id) {
            Some(entry) => {
                Self::deliver(entry, &frame)?;
                true
            }
            None => false,
        };

        // Late credit for a finished stream is harmless; anything else gets a reset
        if !delivered && !frame.is_window_update() && !frame.is_ack() {
            trace!(stream_id, "Frame for unknown stream, resetting");
            shared.send_frame(Frame::rst(stream_id))?;
        }
        Ok(())
    }

    fn deliver(entry: &mut StreamEntry, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.is_ack() {
            if let Some(opened) = entry.opened.take() {
                let _ = opened.send(());
            }
            return Ok(());
        }

        if frame.is_window_update() {
            let delta = frame.window_delta()?;
            entry.send_credit.add_permits(delta as usize);
            return Ok(());
        }

        if !frame.payload.is_empty() {
            let _ = entry.inbound.send(Inbound::Data(frame.payload.clone()));
        }
        if frame.is_fin() {
            let _ = entry.inbound.send(Inbound::Fin);
        }
        Ok(())
    }

    fn accept_syn(
        shared: &Arc<Shared>,
        stream_id: u32,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> Result<(), ProtocolError> {
        let known = shared.lock_streams().contains_key(&stream_id);
        if !shared.role.is_peer_stream(stream_id) || known {
            warn!(stream_id, "Rejecting invalid stream open");
            return shared.send_frame(Frame::rst(stream_id));
        }

        let stream = Self::register_stream(shared, stream_id, None)?;
        shared.send_frame(Frame::ack(stream_id))?;

        if accept_tx.try_send(stream).is_err() {
            warn!(stream_id, "Accept backlog full, resetting stream");
            shared.reset_stream(stream_id);
        }
        Ok(())
    }
}

async fn write_loop<W>(
    writer: W,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(writer);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.send(&frame).await {
                    debug!("Transport write failed: {}", e);
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    let _ = writer.close().await;
    debug!("Multiplexer writer stopped");
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>, accept_tx: mpsc::Sender<MuxStream>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(reader);
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = reader.next() => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Transport reached end of stream");
                    break;
                }
                Err(e) => {
                    warn!("Transport read failed: {}", e);
                    break;
                }
            }
        };

        if let Err(e) = Shared::dispatch(&shared, frame, &accept_tx) {
            debug!("Stopping multiplexer reader: {}", e);
            break;
        }
    }

    shared.shutdown.cancel();
    shared.lock_streams().clear();
    debug!("Multiplexer reader stopped");
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.keepalive_interval);
    ticker.tick().await;
    let mut nonce = 0u32;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if nonce != 0 && shared.ping_answered.load(Ordering::Acquire) != nonce {
                    warn!(nonce, "Keepalive ping unanswered, closing session");
                    shared.shutdown.cancel();
                    break;
                }
                // 0 means "nothing answered yet"
                nonce = match nonce.wrapping_add(1) {
                    0 => 1,
                    next => next,
                };
                if shared.send_frame(Frame::ping(nonce)).is_err() {
                    break;
                }
            }
        }
    }
}

/// Runs both pumps of one stream and cleans up its entry afterwards
async fn drive_stream(
    shared: Arc<Shared>,
    stream_id: u32,
    mux_io: DuplexStream,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    send_credit: Arc<Semaphore>,
    reset: CancellationToken,
) {
    let (mux_read, mux_write) = tokio::io::split(mux_io);
    let outbound = pump_outbound(&shared, stream_id, mux_read, send_credit, &reset);
    let inbound = pump_inbound(&shared, stream_id, mux_write, inbound_rx, &reset);
    tokio::pin!(outbound, inbound);

    let close_timeout = shared.config.stream_close_timeout;
    let mut outbound_done = false;
    let mut inbound_done = false;
    while !(outbound_done && inbound_done) {
        tokio::select! {
            _ = &mut outbound, if !outbound_done => outbound_done = true,
            _ = &mut inbound, if !inbound_done => inbound_done = true,
            _ = tokio::time::sleep(close_timeout), if outbound_done && !inbound_done => {
                debug!(stream_id, "Peer did not finish stream within close timeout");
                shared.reset_stream(stream_id);
                break;
            }
        }
    }

    shared.remove_stream(stream_id);
    trace!(stream_id, "Stream finished");
}

/// Local writes -> DATA frames; EOF -> FIN
async fn pump_outbound(
    shared: &Shared,
    stream_id: u32,
    mut source: ReadHalf<DuplexStream>,
    send_credit: Arc<Semaphore>,
    reset: &CancellationToken,
) {
    let window = shared.config.max_stream_window.max(1) as usize;
    let mut buf = vec![0u8; MAX_DATA_CHUNK.min(window)];

    loop {
        let n = tokio::select! {
            _ = reset.cancelled() => return,
            read = source.read(&mut buf) => match read {
                Ok(n) => n,
                Err(_) => 0,
            }
        };

        if n == 0 {
            let _ = shared.send_frame(Frame::fin(stream_id));
            return;
        }

        let permit = tokio::select! {
            _ = reset.cancelled() => return,
            permit = send_credit.acquire_many(n as u32) => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            }
        };
        permit.forget();

        if shared
            .send_frame(Frame::data(stream_id, Bytes::copy_from_slice(&buf[..n])))
            .is_err()
        {
            return;
        }
    }
}

/// DATA frames -> local reads, with credit returned as the reader drains them
async fn pump_inbound(
    shared: &Shared,
    stream_id: u32,
    mut sink: WriteHalf<DuplexStream>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    reset: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = reset.cancelled() => None,
            event = inbound_rx.recv() => event,
        };

        match event {
            Some(Inbound::Data(data)) => {
                let written = tokio::select! {
                    _ = reset.cancelled() => break,
                    written = sink.write_all(&data) => written,
                };
                if written.is_err() {
                    // Local handle is gone; stop the peer from sending more
                    shared.reset_stream(stream_id);
                    return;
                }
                let _ = shared.send_frame(Frame::window_update(stream_id, data.len() as u32));
            }
            Some(Inbound::Fin) | None => break,
        }
    }

    let _ = sink.shutdown().await;
}

impl MuxStream {
    /// Logical stream identifier
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    /// Half-close: the peer reads EOF, this side can keep reading
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn pair(config: MuxConfig) -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            MuxSession::client(a, config.clone()),
            MuxSession::server(b, config),
        )
    }

    #[tokio::test]
    async fn test_open_accept_and_echo() {
        let (client, server) = pair(MuxConfig::default());

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
            server
        });

        let mut stream = client.open_stream().await.unwrap();
        assert_eq!(stream.stream_id(), 1);
        stream.write_all(b"hello").await.unwrap();

        let mut echoed = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"hello");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ids_follow_role_parity() {
        let (client, server) = pair(MuxConfig::default());

        let accept = tokio::spawn(async move {
            let first = server.accept_stream().await.unwrap();
            let second = server.accept_stream().await.unwrap();
            (first.stream_id(), second.stream_id(), server)
        });

        let a = client.open_stream().await.unwrap();
        let b = client.open_stream().await.unwrap();
        assert_eq!((a.stream_id(), b.stream_id()), (1, 3));

        let (first, second, server) = accept.await.unwrap();
        assert_eq!((first, second), (1, 3));

        let reverse = tokio::spawn(async move {
            let id = client.accept_stream().await.unwrap().stream_id();
            (id, client)
        });
        let c = server.open_stream().await.unwrap();
        assert_eq!(c.stream_id(), 2);
        let (accepted, _client) = reverse.await.unwrap();
        assert_eq!(accepted, 2);
    }

    #[tokio::test]
    async fn test_half_close_keeps_reverse_direction_open() {
        let (client, server) = pair(MuxConfig::default());

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            // Client already finished writing; the reply still reaches it
            stream.write_all(&request).await.unwrap();
            stream.write_all(b"-done").await.unwrap();
            drop(stream);
            server
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"ping-done");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flow_control_moves_more_than_one_window() {
        let config = MuxConfig {
            max_stream_window: 1024,
            ..MuxConfig::default()
        };
        let (client, server) = pair(config);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            (received, server)
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let (received, _server) = timeout(Duration::from_secs(10), server_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_close_fails_pending_operations() {
        let (client, server) = pair(MuxConfig::default());
        let server = Arc::new(server);

        let pending_accept = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept_stream().await })
        };

        server.close();
        assert!(server.is_closed());
        let result = timeout(Duration::from_secs(5), pending_accept)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::SessionClosed)));

        // The peer notices the transport going away
        timeout(Duration::from_secs(5), client.closed()).await.unwrap();
        assert!(matches!(
            client.open_stream().await,
            Err(ProtocolError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_session_close_ends_stream_io() {
        let (client, server) = pair(MuxConfig::default());

        let accepted = tokio::spawn(async move {
            let stream = server.accept_stream().await.unwrap();
            (stream, server)
        });
        let mut stream = client.open_stream().await.unwrap();
        let (_peer_stream, _server) = accepted.await.unwrap();

        client.close();
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_cleaned_up() {
        let (client, server) = pair(MuxConfig::default());

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.unwrap();
            let mut sink = Vec::new();
            stream.read_to_end(&mut sink).await.unwrap();
            drop(stream);
            server
        });

        let stream = client.open_stream().await.unwrap();
        assert_eq!(client.stream_count(), 1);
        drop(stream);

        let server = server_task.await.unwrap();
        timeout(Duration::from_secs(5), async {
            while client.stream_count() > 0 || server.stream_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unacknowledged_open_times_out() {
        // A peer that never speaks the protocol
        let (a, _silent) = tokio::io::duplex(1024);
        let config = MuxConfig {
            stream_open_timeout: Duration::from_millis(50),
            enable_keepalive: false,
            ..MuxConfig::default()
        };
        let client = MuxSession::client(a, config);

        assert!(matches!(
            client.open_stream().await,
            Err(ProtocolError::Timeout(_))
        ));
        assert_eq!(client.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_fails_keepalive() {
        let (a, _silent) = tokio::io::duplex(64 * 1024);
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            ..MuxConfig::default()
        };
        let client = MuxSession::client(a, config);

        timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("session should close once pings go unanswered");
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream().await,
            Err(ProtocolError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_answered_keepalive_keeps_session_up() {
        let (client, server) = pair(MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            ..MuxConfig::default()
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }
}
