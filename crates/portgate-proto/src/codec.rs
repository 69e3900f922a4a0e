//! Length-prefixed frame transport
//!
//! Every frame travels as a big-endian `u32` length followed by the
//! MessagePack encoding of [`Frame`]. The multiplexer drives one
//! [`FrameReader`] and one [`FrameWriter`] per transport, each owned by its
//! own task.

use crate::{Frame, ProtocolError};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest encoded frame either side accepts (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

fn check_len(len: usize, limit: usize) -> Result<(), ProtocolError> {
    if len > limit {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: limit,
        });
    }
    Ok(())
}

/// Append the wire form of `frame` to `dst`
pub fn encode_into(frame: &Frame, dst: &mut BytesMut, limit: usize) -> Result<(), ProtocolError> {
    let body = frame.to_msgpack()?;
    check_len(body.len(), limit)?;
    dst.reserve(LENGTH_PREFIX + body.len());
    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(&body);
    Ok(())
}

/// Decodes frames out of an async byte stream
pub struct FrameReader<R> {
    inner: R,
    pending: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `inner` with the default size limit
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_SIZE)
    }

    /// Wrap `inner`, rejecting frames larger than `limit`
    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            pending: BytesMut::with_capacity(16 * 1024),
            limit,
        }
    }

    /// Next frame, or `None` once the stream ends on a frame boundary.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn next(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.decode()? {
                return Ok(Some(frame));
            }
            if self.inner.read_buf(&mut self.pending).await? == 0 {
                return match self.pending.is_empty() {
                    true => Ok(None),
                    false => Err(ProtocolError::InvalidFrame),
                };
            }
        }
    }

    fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some(prefix) = self.pending.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        check_len(len, self.limit)?;

        let wanted = LENGTH_PREFIX + len;
        if self.pending.len() < wanted {
            self.pending.reserve(wanted - self.pending.len());
            return Ok(None);
        }

        self.pending.advance(LENGTH_PREFIX);
        let body = self.pending.split_to(len);
        Frame::from_msgpack(&body).map(Some)
    }

    /// Bytes read but not yet decoded
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Encodes frames onto an async byte stream
pub struct FrameWriter<W> {
    inner: W,
    scratch: BytesMut,
    limit: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap `inner` with the default size limit
    pub fn new(inner: W) -> Self {
        Self::with_limit(inner, MAX_FRAME_SIZE)
    }

    /// Wrap `inner`, refusing to send frames larger than `limit`
    pub fn with_limit(inner: W, limit: usize) -> Self {
        Self {
            inner,
            scratch: BytesMut::new(),
            limit,
        }
    }

    /// Write one frame and flush it
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.scratch.clear();
        encode_into(frame, &mut self.scratch, self.limit)?;
        self.inner.write_all(&self.scratch).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying writer
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
