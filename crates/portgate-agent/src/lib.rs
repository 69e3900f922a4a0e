//! # Portgate Agent
//!
//! Server side of the gateway. Runs on the remote host, speaks the
//! multiplexed protocol over its standard input and output, and dials
//! allow-listed targets on behalf of the client.

#![warn(missing_docs)]

/// Allow-list checks
pub mod access;

/// Reusable transfer buffers
pub mod buffer_pool;

/// YAML configuration
pub mod config;

/// Error types for the agent
pub mod error;

/// Handshake and connect handlers
pub mod handlers;

/// Counters and the metrics endpoint
pub mod metrics;

/// Byte pump between a stream and its target
pub mod proxy;

/// Per-session accept loop and admission control
pub mod server;

/// Standard input and output as one transport
pub mod stdio;

pub use access::AccessController;
pub use buffer_pool::{BufferPool, BufferPoolConfig, PooledBuffer, BUFFER_SIZE};
pub use config::ServerConfig;
pub use error::{AgentError, Result};
pub use metrics::{spawn_metrics_server, MetricsSnapshot, ServerMetrics};
pub use server::{Server, ServerState};
pub use stdio::StdioStream;
