//! Joins separate read and write halves into one duplex stream

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};

/// A reader and a writer presented as a single transport
pub struct StdioStream<R, W> {
    /// Input stream (stdin in the agent binary)
    reader: R,
    /// Output stream (stdout in the agent binary)
    writer: W,
}

impl StdioStream<Stdin, Stdout> {
    /// The process's own standard input and output
    pub fn process() -> Self {
        Self::new(stdin(), stdout())
    }
}

impl<R, W> StdioStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Pair `reader` with `writer`
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> AsyncRead for StdioStream<R, W>
where
    R: AsyncRead + Unpin,
    W: Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R, W> AsyncWrite for StdioStream<R, W>
where
    R: Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
