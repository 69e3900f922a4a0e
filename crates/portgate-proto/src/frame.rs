//! Frame structure and serialization

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Stream id reserved for session-level control frames (keepalive pings).
pub const SESSION_STREAM_ID: u32 = 0;

/// Frame flags describing what a frame does to its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Plain data frame
    pub const NONE: Self = Self(0);
    /// Opens a new stream
    pub const SYN: Self = Self(1);
    /// Sender will write no more data on this stream
    pub const FIN: Self = Self(2);
    /// Abort the stream in both directions
    pub const RST: Self = Self(4);
    /// Payload is a big-endian u32 window credit
    pub const WINDOW_UPDATE: Self = Self(8);
    /// Session keepalive ping
    pub const PING: Self = Self(16);
    /// Acknowledges a PING or a stream open
    pub const ACK: Self = Self(32);

    /// Whether every bit of `flag` is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        self.0 & flag.0 == flag.0 && flag.0 != 0
    }

    /// Add the bits of `flag`
    pub fn set_flag(&mut self, flag: FrameFlags) {
        self.0 |= flag.0;
    }
}

/// Multiplexer frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Logical stream identifier
    pub stream_id: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            stream_id,
            flags,
            payload,
        }
    }

    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(stream_id, FrameFlags::NONE, payload)
    }

    /// Create a stream-open frame
    pub fn syn(stream_id: u32) -> Self {
        Self::new(stream_id, FrameFlags::SYN, Bytes::new())
    }

    /// Create the acknowledgement for a stream open
    pub fn ack(stream_id: u32) -> Self {
        Self::new(stream_id, FrameFlags::ACK, Bytes::new())
    }

    /// Create a half-close frame
    pub fn fin(stream_id: u32) -> Self {
        Self::new(stream_id, FrameFlags::FIN, Bytes::new())
    }

    /// Create a reset frame
    pub fn rst(stream_id: u32) -> Self {
        Self::new(stream_id, FrameFlags::RST, Bytes::new())
    }

    /// Create a window update granting `delta` more bytes of credit
    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(delta);
        Self::new(stream_id, FrameFlags::WINDOW_UPDATE, buf.freeze())
    }

    /// Create a keepalive ping
    pub fn ping(nonce: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(nonce);
        Self::new(SESSION_STREAM_ID, FrameFlags::PING, buf.freeze())
    }

    /// Create the acknowledgement for a received ping
    pub fn pong(ping: &Frame) -> Self {
        let mut flags = FrameFlags::PING;
        flags.set_flag(FrameFlags::ACK);
        Self::new(SESSION_STREAM_ID, flags, ping.payload.clone())
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn payload_u32(&self) -> Result<u32, ProtocolError> {
        if self.payload.len() != 4 {
            return Err(ProtocolError::InvalidFrame);
        }
        Ok((&self.payload[..]).get_u32())
    }

    /// Window credit carried by a WINDOW_UPDATE frame
    pub fn window_delta(&self) -> Result<u32, ProtocolError> {
        self.payload_u32()
    }

    /// Nonce carried by a ping or its acknowledgement
    pub fn ping_nonce(&self) -> Result<u32, ProtocolError> {
        self.payload_u32()
    }

    /// Check if this frame opens a stream
    pub fn is_syn(&self) -> bool {
        self.flags.has_flag(FrameFlags::SYN)
    }

    /// Check if this frame half-closes its stream
    pub fn is_fin(&self) -> bool {
        self.flags.has_flag(FrameFlags::FIN)
    }

    /// Check if this frame resets its stream
    pub fn is_rst(&self) -> bool {
        self.flags.has_flag(FrameFlags::RST)
    }

    /// Check if this frame is a window update
    pub fn is_window_update(&self) -> bool {
        self.flags.has_flag(FrameFlags::WINDOW_UPDATE)
    }

    /// Check if this frame is a keepalive ping or its acknowledgement
    pub fn is_ping(&self) -> bool {
        self.flags.has_flag(FrameFlags::PING)
    }

    /// Check if this frame acknowledges a ping
    pub fn is_ack(&self) -> bool {
        self.flags.has_flag(FrameFlags::ACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::NONE;
        assert!(!flags.has_flag(FrameFlags::FIN));

        flags.set_flag(FrameFlags::FIN);
        assert!(flags.has_flag(FrameFlags::FIN));
        assert!(!flags.has_flag(FrameFlags::RST));
        assert!(!flags.has_flag(FrameFlags::NONE));
    }

    #[test]
    fn test_control_frames() {
        assert!(Frame::syn(1).is_syn());
        assert!(Frame::fin(1).is_fin());
        assert!(Frame::rst(1).is_rst());
        assert!(Frame::ack(1).is_ack() && !Frame::ack(1).is_ping());

        let data = Frame::data(3, Bytes::from("payload"));
        assert!(!data.is_syn() && !data.is_fin() && !data.is_rst());
        assert_eq!(data.payload, Bytes::from("payload"));
    }

    #[test]
    fn test_window_update_delta() {
        let frame = Frame::window_update(7, 65536);
        assert!(frame.is_window_update());
        assert_eq!(frame.window_delta().unwrap(), 65536);

        let bogus = Frame::new(7, FrameFlags::WINDOW_UPDATE, Bytes::from_static(b"x"));
        assert!(matches!(bogus.window_delta(), Err(ProtocolError::InvalidFrame)));
    }

    #[test]
    fn test_ping_pong() {
        let ping = Frame::ping(42);
        assert!(ping.is_ping());
        assert!(!ping.is_ack());
        assert_eq!(ping.stream_id, SESSION_STREAM_ID);

        let pong = Frame::pong(&ping);
        assert!(pong.is_ping());
        assert!(pong.is_ack());
        assert_eq!(pong.payload, ping.payload);
    }

    #[test]
    fn test_msgpack_serialization() {
        let original = Frame::data(123, Bytes::from("test payload data"));

        let serialized = original.to_msgpack().unwrap();
        let deserialized = Frame::from_msgpack(&serialized).unwrap();

        assert_eq!(original.stream_id, deserialized.stream_id);
        assert_eq!(original.flags, deserialized.flags);
        assert_eq!(original.payload, deserialized.payload);
    }
}
