//! Transport error types

use std::io;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach or talk to the remote host
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Remote host rejected the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport process exited before the session was established
    #[error("Transport process exited with code {code}: {message}")]
    ProcessExited {
        /// Exit code of the process, -1 when killed by a signal
        code: i32,
        /// Last diagnostics the process printed
        message: String,
    },
}

impl TransportError {
    /// Build the most specific error for diagnostics printed by `ssh`
    pub fn from_ssh_diagnostics(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("permission denied") || lower.contains("authentication failed") {
            Self::Authentication(message.to_string())
        } else if lower.contains("timed out") {
            Self::Timeout
        } else {
            Self::Connection(message.to_string())
        }
    }
}
