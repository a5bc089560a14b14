//! # Buffer Pool
//!
//! Purpose: Recycle fixed-size response body buffers so decoding a packet does
//! not allocate on every request.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded LIFO stack of owned backing buffers.
//! 2. **Minimal Locking**: Hold the mutex only while pushing or popping a buffer.
//! 3. **Bypass Large Bodies**: Requests above the fixed size get a dedicated
//!    allocation that is simply dropped on release.
//! 4. **RAII Release**: A `PooledBuf` goes home when released or dropped, so
//!    every exit path returns it exactly once.
//!
//! ## Notes
//! - Returning a buffer is immediate. Release consumes the `PooledBuf`, so the
//!   borrow checker already guarantees nothing still reads the bytes.
//! - When the free list is full the backing buffer is dropped instead of
//!   growing the pool.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// Maximum number of idle buffers kept by a pool.
pub const POOL_SIZE: usize = 64;

/// Size of each pooled backing buffer.
pub const BUFFER_SIZE: usize = 8192;

static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();

/// Bounded free-list of fixed-size byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    capacity: usize,
    buffer_size: usize,
    recycles: AtomicU64,
}

impl BufferPool {
    /// Creates a pool with the default limits (`POOL_SIZE` x `BUFFER_SIZE`).
    pub fn new() -> Arc<Self> {
        Self::with_limits(POOL_SIZE, BUFFER_SIZE)
    }

    /// Creates a pool keeping at most `capacity` idle buffers of
    /// `buffer_size` bytes each.
    pub fn with_limits(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            buffer_size,
            recycles: AtomicU64::new(0),
        })
    }

    /// Process-wide pool used by connections that are not given their own.
    pub fn shared() -> Arc<Self> {
        SHARED.get_or_init(BufferPool::new).clone()
    }

    /// Hands out a buffer of exactly `size` bytes.
    ///
    /// **Logic**:
    /// 1. Sizes above the fixed buffer size get a dedicated, unpooled allocation.
    /// 2. Otherwise pop the most recently returned buffer, or allocate a new one.
    /// 3. Expose only the first `size` bytes of the backing buffer.
    pub fn acquire(self: &Arc<Self>, size: usize) -> PooledBuf {
        if size > self.buffer_size {
            return PooledBuf {
                backing: vec![0u8; size].into_boxed_slice(),
                len: size,
                home: None,
            };
        }

        let backing = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());

        PooledBuf {
            backing,
            len: size,
            home: Some(self.clone()),
        }
    }

    /// Number of idle buffers ready to be handed out.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Total number of buffers that made it back onto the free list.
    pub fn recycles(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }

    fn recycle(&self, backing: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() >= self.capacity {
            // Full: let the allocation go rather than grow.
            return;
        }
        free.push(backing);
        self.recycles.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .field("buffer_size", &self.buffer_size)
            .field("recycles", &self.recycles())
            .finish()
    }
}

/// A `size`-byte view over a (possibly pooled) backing buffer.
///
/// Dropping the value or calling [`PooledBuf::release`] returns the backing
/// buffer to its pool. Unpooled buffers are just freed.
pub struct PooledBuf {
    backing: Box<[u8]>,
    len: usize,
    home: Option<Arc<BufferPool>>,
}

impl PooledBuf {
    /// True when the buffer will be returned to a pool on release.
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Returns the buffer to its pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.backing[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.backing[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take() {
            pool.recycle(std::mem::take(&mut self.backing));
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBuf({}B, pooled={})", self.len, self.is_pooled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_exact_size() {
        let pool = BufferPool::new();
        let buf = pool.acquire(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.is_pooled());
    }

    #[test]
    fn released_buffer_is_reused_lifo() {
        let pool = BufferPool::new();
        let first = pool.acquire(10);
        let second = pool.acquire(20);
        let second_ptr = second.as_ptr();
        first.release();
        second.release();
        assert_eq!(pool.available(), 2);

        let again = pool.acquire(30);
        assert_eq!(again.as_ptr(), second_ptr);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let pool = BufferPool::new();
        let held: Vec<PooledBuf> = (0..POOL_SIZE + 36).map(|_| pool.acquire(BUFFER_SIZE)).collect();
        drop(held);

        assert_eq!(pool.available(), POOL_SIZE);
        assert_eq!(pool.recycles(), POOL_SIZE as u64);
    }

    #[test]
    fn oversized_requests_bypass_the_pool() {
        let pool = BufferPool::new();
        let pooled = pool.acquire(BUFFER_SIZE);
        pooled.release();
        assert_eq!(pool.available(), 1);

        let big = pool.acquire(BUFFER_SIZE + 1);
        assert!(!big.is_pooled());
        assert_eq!(big.len(), BUFFER_SIZE + 1);
        assert_eq!(pool.available(), 1);

        big.release();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.recycles(), 1);
    }

    #[test]
    fn writes_stay_within_the_view() {
        let pool = BufferPool::with_limits(2, 16);
        let mut buf = pool.acquire(4);
        buf.copy_from_slice(b"abcd");
        assert_eq!(&buf[..], b"abcd");
    }

    #[test]
    fn shared_pool_is_a_singleton() {
        assert!(Arc::ptr_eq(&BufferPool::shared(), &BufferPool::shared()));
    }
}
