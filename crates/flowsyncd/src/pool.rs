//! Bounded, reusable packet buffer pool.
//!
//! The one structure in the daemon shared across threads (the tap read
//! paths and the event loop), so the freelist is mutex-guarded. Acquire
//! never blocks: an empty freelist fails with [`PoolError::Exhausted`]
//! and the caller drops the frame. Release happens on guard drop, always
//! succeeds, and clears the buffer before returning it.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("packet buffer pool exhausted")]
    Exhausted,
}

/// Saturating counters for pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub exhausted: u64,
}

struct Inner {
    freelist: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<PoolStats>,
    buffer_capacity: usize,
}

/// Shared handle to the pool; clones refer to the same freelist.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<Inner>,
}

impl PacketPool {
    pub fn new(buffers: usize, buffer_capacity: usize) -> Self {
        let freelist = (0..buffers)
            .map(|_| Vec::with_capacity(buffer_capacity))
            .collect();
        Self {
            inner: Arc::new(Inner {
                freelist: Mutex::new(freelist),
                stats: Mutex::new(PoolStats::default()),
                buffer_capacity,
            }),
        }
    }

    /// Takes a buffer from the freelist. Fails instead of blocking when
    /// the pool is empty.
    pub fn acquire(&self) -> Result<PacketBuffer, PoolError> {
        let buffer = self.inner.freelist.lock().pop();
        let mut stats = self.inner.stats.lock();
        match buffer {
            Some(buffer) => {
                stats.acquired = stats.acquired.saturating_add(1);
                drop(stats);
                Ok(PacketBuffer {
                    pool: self.clone(),
                    buffer,
                })
            }
            None => {
                stats.exhausted = stats.exhausted.saturating_add(1);
                Err(PoolError::Exhausted)
            }
        }
    }

    pub fn available(&self) -> usize {
        self.inner.freelist.lock().len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    pub fn stats(&self) -> PoolStats {
        *self.inner.stats.lock()
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.inner.freelist.lock().push(buffer);
    }
}

/// An acquired buffer; returns itself to the pool on drop.
pub struct PacketBuffer {
    pool: PacketPool,
    buffer: Vec<u8>,
}

impl PacketBuffer {
    /// Fills the buffer with `len` zeroed bytes for a read syscall to
    /// overwrite. `len` is clamped to the pool's buffer capacity so a
    /// buffer never grows past its preallocation.
    pub fn reset_for_read(&mut self, len: usize) {
        let len = len.min(self.pool.buffer_capacity());
        self.buffer.clear();
        self.buffer.resize(len, 0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
    }
}

impl std::ops::Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::ops::DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = PacketPool::new(2, 64);
        assert_eq!(pool.available(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhausted_fails_instead_of_blocking() {
        let pool = PacketPool::new(1, 64);
        let _held = pool.acquire().unwrap();

        assert!(matches!(pool.acquire(), Err(PoolError::Exhausted)));
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[test]
    fn test_release_clears_buffer() {
        let pool = PacketPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf.reset_for_read(16);
        buf[0] = 0xff;
        drop(buf);

        let buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reset_clamps_to_capacity() {
        let pool = PacketPool::new(1, 64);
        let mut buf = pool.acquire().unwrap();
        buf.reset_for_read(4096);
        assert_eq!(buf.len(), 64);
    }
}
