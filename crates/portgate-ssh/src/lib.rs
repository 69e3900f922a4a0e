//! # Portgate SSH Transport
//!
//! Produces the single duplex byte stream a Portgate session runs over:
//! the system `ssh` client launching the remote agent in stdio mode, a
//! locally spawned agent, or an in-process stream.

#![warn(missing_docs)]

/// Login settings and endpoints
pub mod config;

/// Ways of reaching the agent
pub mod transport;

/// Established transport connection
pub mod connection;

/// Transport error types
pub mod error;

pub use config::{
    split_host_port, Endpoint, SshConfig, TransportKind, DEFAULT_AGENT_PATH, DEFAULT_SSH_PORT,
};
pub use connection::{BoxedIo, Connection, DuplexIo, ProcessIo};
pub use error::TransportError;
pub use transport::{DuplexTransport, LocalTransport, SshTransport, Transport};
