//! Handshake and connect messages exchanged on logical streams
//!
//! Each logical stream carries exactly one request and one response. The
//! request travels inside a [`Message`] envelope; the response is sent bare
//! because its shape is implied by the request. Both are written as a
//! big-endian `u32` length followed by a named-field MessagePack map, so
//! decoders consume exactly one message and never touch the raw bytes that
//! follow a successful connect.

use crate::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version advertised in handshakes
pub const PROTOCOL_VERSION: &str = "2.0";

/// Upper bound for a single protocol message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Request envelope, tagged by message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Session handshake, sent once on a dedicated stream
    Handshake(HandshakeRequest),
    /// Request to dial a target and switch the stream to raw forwarding
    Connect(ConnectRequest),
}

impl Message {
    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Connect(_) => "connect",
        }
    }
}

/// Client half of the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client protocol version
    pub version: String,
}

impl HandshakeRequest {
    /// Handshake for the current protocol version
    pub fn current() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One allow-listed remote target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Exact `host:port` string clients may request
    pub target: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the client should bind a fixed local port for this target
    #[serde(default, rename = "static")]
    pub is_static: bool,
    /// Preferred local port for static bindings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl PortConfig {
    /// Allow-list entry for `target` with no local binding hint
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            ..Default::default()
        }
    }
}

/// Server half of the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Server protocol version
    pub version: String,
    /// Targets this server will dial on the client's behalf
    #[serde(default)]
    pub allowed_ports: Vec<PortConfig>,
    /// Set when the server refuses the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request to forward the stream to a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// `host:port` the server should dial
    pub target: String,
}

/// Outcome of a connect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Whether the stream now carries raw target bytes
    pub success: bool,
    /// Reason for failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResponse {
    /// Successful connect
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed connect with a reason
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Encode `value` and write it as one length-prefixed message, then flush.
///
/// Callers must let this complete before pumping raw bytes on the stream.
pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = rmp_serde::to_vec_named(value)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one length-prefixed message.
///
/// Blocks until the whole message is available; a stream that ends first
/// yields [`ProtocolError::StreamClosed`].
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::StreamClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::StreamClosed)
        }
        Err(e) => return Err(e.into()),
    }

    Ok(rmp_serde::from_slice(&body)?)
}
