//! Agent counters and the optional plain-text `/metrics` endpoint

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Process-wide agent counters
#[derive(Debug, Default)]
pub struct ServerMetrics {
    active_streams: AtomicU64,
    total_streams: AtomicU64,
    total_bytes: AtomicU64,
    handshake_count: AtomicU64,
    connect_count: AtomicU64,
    connect_errors: AtomicU64,
    denied_requests: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Streams currently holding an admission slot
    pub active_streams: u64,
    /// Streams admitted since start
    pub total_streams: u64,
    /// Bytes forwarded in both directions
    pub total_bytes: u64,
    /// Handshakes served
    pub handshake_count: u64,
    /// Connect requests received
    pub connect_count: u64,
    /// Connect requests whose dial failed
    pub connect_errors: u64,
    /// Streams rejected by admission control or the allow-list
    pub denied_requests: u64,
}

impl ServerMetrics {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stream_admitted(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_released(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn handshake(&self) {
        self.handshake_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect(&self) {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect_error(&self) {
        self.connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn denied(&self) {
        self.denied_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_streams: self.active_streams.load(Ordering::Relaxed),
            total_streams: self.total_streams.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            handshake_count: self.handshake_count.load(Ordering::Relaxed),
            connect_count: self.connect_count.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            denied_requests: self.denied_requests.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Plain-text exposition served at `/metrics`
    pub fn render(&self) -> String {
        let mut out = String::from("# Server Metrics\n");
        for (name, value) in [
            ("active_streams", self.active_streams),
            ("total_streams", self.total_streams),
            ("total_bytes", self.total_bytes),
            ("handshake_count", self.handshake_count),
            ("connect_count", self.connect_count),
            ("connect_errors", self.connect_errors),
            ("denied_requests", self.denied_requests),
        ] {
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}

/// Router exposing `GET /metrics`
pub fn router(metrics: Arc<ServerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<ServerMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        metrics.snapshot().render(),
    )
}

/// Bind the metrics endpoint on loopback and serve it in the background
pub async fn spawn_metrics_server(
    metrics: Arc<ServerMetrics>,
    port: u16,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    info!("Metrics server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(metrics)).await {
            warn!("Metrics server error: {}", e);
        }
    });
    Ok(addr)
}
