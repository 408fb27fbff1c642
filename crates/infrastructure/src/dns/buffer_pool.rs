use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Length prefix plus a typical EDNS(0) sized query.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2 + 1232;

/// Buffers that grew past this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 2 + 4096;

const DEFAULT_MAX_IDLE: usize = 256;

/// Pool of reusable byte buffers for framed DNS queries.
///
/// Buffers are handed out as [`PooledBuffer`] guards and return to the pool
/// when dropped, so a spawned exchange task releases its buffer no matter
/// how it finishes.
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,

    max_idle: usize,

    buffer_capacity: usize,

    total_created: AtomicU64,

    total_reused: AtomicU64,
}

impl BufferPool {
    pub fn new(max_idle: usize, buffer_capacity: usize) -> Self {
        debug!(max_idle, buffer_capacity, "Initializing DNS buffer pool");

        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            buffer_capacity,
            total_created: AtomicU64::new(0),
            total_reused: AtomicU64::new(0),
        }
    }

    /// Takes an idle buffer or allocates a new one. The buffer is empty.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match reused {
            Some(buf) => {
                self.total_reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.total_created.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_capacity)
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Returns a buffer to the pool. Oversized buffers and buffers beyond
    /// `max_idle` are dropped.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_reused: self.total_reused.load(Ordering::Relaxed),
            idle: self
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE, DEFAULT_BUFFER_CAPACITY)
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub total_created: u64,
    pub total_reused: u64,
    pub idle: usize,
}

impl BufferPoolStats {
    pub fn reuse_rate(&self) -> f64 {
        let total = self.total_created + self.total_reused;
        if total == 0 {
            0.0
        } else {
            self.total_reused as f64 / total as f64
        }
    }
}
