//! Frame buffer pool
//!
//! Pixel buffers are recycled instead of reallocated every tick. A
//! [`FrameBuffer`] returns its allocation to the pool it came from when it is
//! dropped, so ownership of a frame doubles as ownership of a pool slot.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

struct PoolInner {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

/// Bounded pool of reusable byte buffers
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Create a pool that keeps at most `max_idle` released buffers
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
            }),
        }
    }

    /// Get a zeroed buffer of `len` bytes, reusing a released one if possible
    pub fn acquire(&self, len: usize) -> FrameBuffer {
        let mut data = self.inner.idle.lock().pop().unwrap_or_default();
        data.clear();
        data.resize(len, 0);
        FrameBuffer {
            data,
            pool: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Copy `bytes` into a pooled buffer
    pub fn copy_from(&self, bytes: &[u8]) -> FrameBuffer {
        let mut buffer = self.acquire(bytes.len());
        buffer.copy_from_slice(bytes);
        buffer
    }

    /// Number of released buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn max_idle(&self) -> usize {
        self.inner.max_idle
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("idle", &self.idle())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

/// Pixel storage owned by exactly one frame at a time
pub struct FrameBuffer {
    data: Vec<u8>,
    pool: Option<Weak<PoolInner>>,
}

impl FrameBuffer {
    /// Wrap an allocation that does not belong to any pool
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.pool = None;
        std::mem::take(&mut self.data)
    }
}

impl Clone for FrameBuffer {
    fn clone(&self) -> Self {
        match self.pool.as_ref().and_then(Weak::upgrade) {
            Some(inner) => FramePool { inner }.copy_from(&self.data),
            None => FrameBuffer::detached(self.data.clone()),
        }
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let Some(inner) = self.pool.take().and_then(|w| w.upgrade()) else {
            return;
        };
        let mut idle = inner.idle.lock();
        if idle.len() < inner.max_idle && self.data.capacity() > 0 {
            idle.push(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffers_are_reused() {
        let pool = FramePool::new(2);
        let first = pool.acquire(16);
        let ptr = first.as_ptr();
        drop(first);
        assert_eq!(pool.idle(), 1);

        let second = pool.acquire(16);
        assert_eq!(second.as_ptr(), ptr);
        assert!(second.iter().all(|&b| b == 0));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn idle_list_never_exceeds_bound() {
        let pool = FramePool::new(2);
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire(8)).collect();
        drop(buffers);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn buffers_outlive_their_pool() {
        let pool = FramePool::new(1);
        let buffer = pool.copy_from(&[1, 2, 3]);
        drop(pool);
        let copy = buffer.clone();
        assert_eq!(&copy[..], &[1, 2, 3]);
    }

    #[test]
    fn into_vec_detaches() {
        let pool = FramePool::new(1);
        let data = pool.copy_from(&[9, 9]).into_vec();
        assert_eq!(data, vec![9, 9]);
        assert_eq!(pool.idle(), 0);
    }
}
