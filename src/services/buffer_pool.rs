//! Process-wide pool of reusable byte buffers for buffering uploaded parts.
//!
//! Buffers are handed out as [`PooledBuffer`] guards which return themselves
//! to the pool when dropped, so every exit path of a part (including panics
//! while unwinding) gives its buffer back.

use parking_lot::Mutex;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// Preallocated capacity of a fresh buffer, sized for a typical audio file.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Idle buffers kept around; anything beyond is freed on release.
const MAX_IDLE_BUFFERS: usize = 64;

/// Buffers that grew past this are freed instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024 * 1024;

/// Thread-safe pool of `Vec<u8>` buffers. Cloning shares the same pool.
#[derive(Clone, Debug)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Take a buffer with zero length and at least the pool's capacity.
    /// Contents beyond the length are unspecified.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self.idle.lock().pop();
        let buf = reused.unwrap_or_else(|| Vec::with_capacity(self.capacity));
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// Truncate `buf` and make it available to the next `acquire`.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(buf);
        }
    }

    /// Number of buffers currently waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        // Only `drop` takes the buffer out.
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
