//! Agent error types

use portgate_proto::ProtocolError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the forwarding agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        /// Path that was tried last
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Config file is not valid YAML for [`crate::ServerConfig`]
    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: serde_yaml::Error,
    },

    /// Requested target is not on the allow-list
    #[error("Target {0} not allowed")]
    TargetNotAllowed(String),

    /// Target could not be dialed (including timeouts)
    #[error("Dial failed: {0}")]
    DialFailed(io::Error),

    /// Message exchange on a stream failed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Agent result type
pub type Result<T> = std::result::Result<T, AgentError>;
