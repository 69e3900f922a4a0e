//! Bidirectional byte pump between a logical stream and a dialed target

use crate::buffer_pool::BufferPool;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Bytes moved by one [`pump`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Stream to target
    pub upstream: u64,
    /// Target to stream
    pub downstream: u64,
}

impl Transferred {
    /// Both directions together
    pub fn total(&self) -> u64 {
        self.upstream + self.downstream
    }
}

/// Copy in both directions until each side has finished.
///
/// When the stream stops sending, the target's write side is shut down so it
/// sees end-of-input while its replies keep flowing back. When the target
/// stops sending, the stream is shut down. Copy errors end their direction
/// quietly. Both directions borrow a buffer from `pool`.
pub async fn pump<S, T>(stream: S, target: T, pool: &BufferPool) -> Transferred
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let upstream = async {
        let mut buf = pool.acquire();
        let n = copy_with_buffer(&mut stream_read, &mut target_write, &mut buf).await;
        let _ = target_write.shutdown().await;
        n
    };

    let downstream = async {
        let mut buf = pool.acquire();
        let n = copy_with_buffer(&mut target_read, &mut stream_write, &mut buf).await;
        let _ = stream_write.shutdown().await;
        n
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    Transferred {
        upstream,
        downstream,
    }
}

async fn copy_with_buffer<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = match reader.read(buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                trace!("Copy read ended: {}", e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!("Copy write ended: {}", e);
            break;
        }
        total += n as u64;
    }
    total
}
