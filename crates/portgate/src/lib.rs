//! # Portgate
//!
//! Client side of a port-forwarding gateway. A [`ConnectionManager`]
//! starts the remote agent over SSH, multiplexes one session over that
//! transport and forwards local TCP listeners to targets the agent allows.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use portgate_proto as proto;
pub use portgate_ssh as ssh;

/// Error types for the Portgate client
pub mod error;

/// Local listeners and connection forwarding
pub mod forward;

/// Transport traffic counters
pub mod metrics;

/// Session lifecycle management
pub mod session;

pub use error::{classify_transport_error, PortgateError};
pub use forward::{parse_local_addr, ForwardInfo};
pub use metrics::{ClientMetrics, CountedIo, TrafficSnapshot};
pub use session::{ConnectOptions, ConnectResponse, ConnectionManager, TestConnectionResult};

/// Result type alias for Portgate operations
pub type Result<T> = std::result::Result<T, PortgateError>;
