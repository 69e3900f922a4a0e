//! Established transport connection

use crate::TransportError;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

/// Number of stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 16;

/// Anything usable as the duplex byte stream under a session
pub trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexIo for T {}

/// Boxed duplex byte stream
pub type BoxedIo = Box<dyn DuplexIo>;

/// A child's stdout and stdin joined into one duplex stream
#[derive(Debug)]
pub struct ProcessIo {
    stdout: ChildStdout,
    stdin: ChildStdin,
}

impl ProcessIo {
    /// Join the given pipes
    pub fn new(stdout: ChildStdout, stdin: ChildStdin) -> Self {
        Self { stdout, stdin }
    }
}

impl AsyncRead for ProcessIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProcessIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// An established connection: the duplex stream plus whatever process backs it
pub struct Connection {
    io: Option<BoxedIo>,
    process: Option<Child>,
    stderr_tail: Arc<Mutex<Vec<String>>>,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("has_io", &self.io.is_some())
            .field("process", &self.process.as_ref().and_then(|c| c.id()))
            .finish()
    }
}

impl Connection {
    /// Wrap a spawned process whose stdin/stdout carry the session
    pub fn from_process(mut child: Child) -> Result<Self, TransportError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connection("Process stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connection("Process stdout not captured".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_stderr(stderr, Arc::clone(&stderr_tail)));
        }

        Ok(Self {
            io: Some(Box::new(ProcessIo::new(stdout, stdin))),
            process: Some(child),
            stderr_tail,
            closed: false,
        })
    }

    /// Wrap an in-process duplex stream
    pub fn from_io(io: impl DuplexIo + 'static) -> Self {
        Self {
            io: Some(Box::new(io)),
            process: None,
            stderr_tail: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Take the duplex stream; the connection keeps owning the process
    pub fn take_io(&mut self) -> Option<BoxedIo> {
        self.io.take()
    }

    /// Whether the connection is open and its backing process (if any) still runs
    pub fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Last lines the backing process wrote to stderr, joined by newlines
    pub fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.is_empty() {
            None
        } else {
            Some(tail.join("\n"))
        }
    }

    /// Process id of the backing process
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|child| child.id())
    }

    /// Close the stream and terminate the backing process
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.io = None;
        self.closed = true;

        if let Some(mut child) = self.process.take() {
            debug!("Terminating transport process");

            if let Err(e) = child.kill().await {
                warn!("Failed to kill transport process: {}", e);
            }

            match child.wait().await {
                Ok(status) => debug!("Transport process exited with status: {}", status),
                Err(e) => warn!("Error waiting for transport process: {}", e),
            }
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
        }
    }
}

async fn collect_stderr(stderr: ChildStderr, tail: Arc<Mutex<Vec<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "portgate_ssh::remote", "{}", line);
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_in_memory_connection() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = Connection::from_io(local);
        assert!(conn.is_alive());
        assert!(conn.process_id().is_none());
        assert!(conn.diagnostics().is_none());

        let mut io = conn.take_io().unwrap();
        assert!(conn.take_io().is_none());

        io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_close_without_process() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut conn = Connection::from_io(local);
        assert!(conn.close().await.is_ok());
        assert!(conn.take_io().is_none());
        assert!(!conn.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_connection_roundtrip() {
        use std::process::Stdio;

        let child = tokio::process::Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut conn = Connection::from_process(child).unwrap();
        assert!(conn.process_id().is_some());

        let mut io = conn.take_io().unwrap();
        io.write_all(b"echo").await.unwrap();
        io.flush().await.unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        drop(io);
        conn.close().await.unwrap();
        assert!(conn.process_id().is_none());
    }
}
