//! # Portgate Protocol
//!
//! Message types, frame codec and the stream multiplexer that carries many
//! forwarded connections over a single duplex byte stream.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Handshake and connect messages exchanged on logical streams
pub mod message;

/// Length-prefixed frame reader and writer
pub mod codec;

/// Stream multiplexing over one duplex transport
pub mod stream;

/// Error types for protocol operations
pub mod error;

pub use codec::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags};
pub use message::{
    read_message, write_message, ConnectRequest, ConnectResponse, HandshakeRequest,
    HandshakeResponse, Message, PortConfig, PROTOCOL_VERSION,
};
pub use stream::{MuxConfig, MuxSession, MuxStream, Role};
