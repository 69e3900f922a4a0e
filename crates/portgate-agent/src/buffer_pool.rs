//! Buffer pool for the copy loops of forwarded connections

use bytes::BytesMut;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

/// Size of each transfer buffer
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Configuration for buffer pool
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Size of each buffer
    pub buffer_size: usize,
    /// Maximum number of idle buffers kept in the pool
    pub max_pooled: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE,
            max_pooled: 64,
        }
    }
}

/// A thread-safe pool of fixed-size transfer buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<BufferPoolInner>>,
}

struct BufferPoolInner {
    buffers: VecDeque<BytesMut>,
    config: BufferPoolConfig,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

impl BufferPool {
    /// Create a new buffer pool with custom configuration
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferPoolInner {
                buffers: VecDeque::with_capacity(config.max_pooled),
                config,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferPoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a buffer from the pool, allocating when none is idle.
    /// It goes back to the pool when the guard is dropped.
    pub fn acquire(&self) -> PooledBuffer {
        let mut inner = self.lock();
        let size = inner.config.buffer_size;
        let buf = match inner.buffers.pop_front() {
            Some(buf) => buf,
            None => {
                let mut buf = BytesMut::with_capacity(size);
                buf.resize(size, 0);
                buf
            }
        };
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn release(&self, buf: BytesMut) {
        let mut inner = self.lock();
        if inner.buffers.len() >= inner.config.max_pooled || buf.len() != inner.config.buffer_size {
            return;
        }
        inner.buffers.push_back(buf);
    }

    /// Number of idle buffers in the pool
    pub fn count(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Size of the buffers this pool hands out
    pub fn buffer_size(&self) -> usize {
        self.lock().config.buffer_size
    }
}

/// Buffer on loan from a [`BufferPool`]
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
