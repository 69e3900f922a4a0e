//! Error types for the Portgate client

use portgate_proto::ProtocolError;
use portgate_ssh::TransportError;
use std::io;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum PortgateError {
    /// The local address is already forwarded by this process
    #[error("Port already in use by this app: {0}")]
    AlreadyInUse(String),

    /// Operation needs an established session
    #[error("Not connected")]
    NotConnected,

    /// Local address could not be parsed
    #[error("Invalid local address: {0}")]
    InvalidAddress(String),

    /// Local listener could not be bound
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        /// Address we tried to bind
        addr: String,
        /// Underlying error
        source: io::Error,
    },

    /// Transport could not be established
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Message exchange or multiplexing failed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server refused the session during the handshake
    #[error("Server error: {0}")]
    Handshake(String),

    /// Server refused to forward a connection
    #[error("Connect to {target} rejected: {reason}")]
    ConnectRejected {
        /// Requested target
        target: String,
        /// Reason given by the server
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PortgateError {
    /// Short message suitable for showing to a user.
    ///
    /// Transport failures are classified into a handful of common causes;
    /// everything else is shown as is.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(TransportError::Timeout) => TIMEOUT_MESSAGE.to_string(),
            Self::Transport(TransportError::Authentication(msg)) => {
                let message = classify_transport_error(msg);
                if message.starts_with("Authentication failed") {
                    message
                } else {
                    AUTH_MESSAGE.to_string()
                }
            }
            Self::Transport(err) => classify_transport_error(&err.to_string()),
            other => other.to_string(),
        }
    }
}

const TIMEOUT_MESSAGE: &str = "Connection timed out: the host could not be reached";
const AUTH_MESSAGE: &str = "Authentication failed: wrong username, password or key";

/// Map a raw transport error message to a short classified one
pub fn classify_transport_error(message: &str) -> String {
    let lower = message.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("connection refused") {
        "Connection refused: the host is not accepting SSH connections".to_string()
    } else if has("timed out") || has("i/o timeout") || has("deadline exceeded") {
        TIMEOUT_MESSAGE.to_string()
    } else if has("no route to host") || has("network is unreachable") {
        "Network unreachable: no route to the host".to_string()
    } else if has("no supported methods remain") || has("no more authentication methods") {
        "Authentication failed: the server does not accept this authentication method".to_string()
    } else if has("permission denied") || has("unable to authenticate") || has("handshake failed") {
        AUTH_MESSAGE.to_string()
    } else {
        format!("Connection failed: {}", message)
    }
}
