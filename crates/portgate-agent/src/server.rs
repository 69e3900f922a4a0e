//! Session accept loop with admission control

use crate::access::AccessController;
use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::handlers;
use crate::metrics::ServerMetrics;
use portgate_proto::{read_message, Message, MuxConfig, MuxSession, MuxStream};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Everything a stream handler needs, fixed for the session's lifetime
pub struct ServerState {
    /// Loaded configuration
    pub config: ServerConfig,
    /// Allow-list snapshot
    pub access: AccessController,
    /// Shared counters
    pub metrics: Arc<ServerMetrics>,
    /// Transfer buffers
    pub buffers: BufferPool,
}

/// Serves one multiplexed session
pub struct Server {
    session: Arc<MuxSession>,
    state: Arc<ServerState>,
    limiter: Arc<Semaphore>,
}

/// Holds an admission slot; releases it and the active-stream gauge on drop
struct StreamSlot {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<ServerMetrics>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.metrics.stream_released();
    }
}

impl Server {
    /// Serve `session` with `config`, counting into `metrics`
    pub fn new(session: MuxSession, config: ServerConfig, metrics: Arc<ServerMetrics>) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_streams.min(Semaphore::MAX_PERMITS)));
        let state = ServerState {
            access: AccessController::new(config.allowed_ports.clone()),
            buffers: BufferPool::default(),
            metrics,
            config,
        };
        Self {
            session: Arc::new(session),
            state: Arc::new(state),
            limiter,
        }
    }

    /// Start a server-role session over `io` and serve it
    pub fn over_io<T>(io: T, config: ServerConfig, metrics: Arc<ServerMetrics>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(MuxSession::server(io, MuxConfig::default()), config, metrics)
    }

    /// Accept streams until the session dies, then stop the handlers.
    ///
    /// Each admitted stream runs in its own task; a stream failing never
    /// stops the loop. Streams over the `max_streams` limit are dropped
    /// without reading anything from them.
    pub async fn serve(self) {
        let mut tasks = JoinSet::new();

        info!(
            max_streams = self.state.config.max_streams,
            allowed_targets = self.state.access.entries().len(),
            "Serving session"
        );

        loop {
            while tasks.try_join_next().is_some() {}

            let stream = match self.session.accept_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    info!("Session accept failed: {}", e);
                    break;
                }
            };

            let permit = match Arc::clone(&self.limiter).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        stream_id = stream.stream_id(),
                        "Stream limit reached ({}), rejecting",
                        self.state.config.max_streams
                    );
                    self.state.metrics.denied();
                    drop(stream);
                    continue;
                }
            };

            self.state.metrics.stream_admitted();
            let slot = StreamSlot {
                _permit: permit,
                metrics: Arc::clone(&self.state.metrics),
            };
            let state = Arc::clone(&self.state);
            tasks.spawn(async move {
                let _slot = slot;
                handle_stream(&state, stream).await;
            });
        }

        // Forwards whose target never hangs up would otherwise outlive the session
        debug!("Stopping {} stream handlers", tasks.len());
        tasks.shutdown().await;
    }
}

async fn handle_stream(state: &ServerState, mut stream: MuxStream) {
    let stream_id = stream.stream_id();

    let message: Message =
        match tokio::time::timeout(state.config.idle_timeout, read_message(&mut stream)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                debug!(stream_id, "Failed to decode message: {}", e);
                return;
            }
            Err(_) => {
                let idle = state.config.idle_timeout;
                warn!(stream_id, "No request within {:?}, closing stream", idle);
                return;
            }
        };

    debug!(stream_id, kind = message.kind(), "Received request");
    let result = match message {
        Message::Handshake(request) => {
            state.metrics.handshake();
            handlers::handle_handshake(state, stream, request).await
        }
        Message::Connect(request) => {
            state.metrics.connect();
            handlers::handle_connect(state, stream, request).await
        }
    };

    if let Err(e) = result {
        debug!(stream_id, "Stream handler failed: {}", e);
    }
}
