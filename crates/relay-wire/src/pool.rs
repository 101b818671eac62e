// Two-tier buffer pool: a small thread-local free list in front of a bounded,
// mutex-protected global free list.
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Buffer;

// Slots in the per-thread cache; the global tier bounds total retention.
const THREAD_CACHE_SLOTS: usize = 8;

thread_local! {
    static THREAD_CACHE: RefCell<Vec<Buffer>> = const { RefCell::new(Vec::new()) };
}

/// Pool of reusable `Buffer`s.
///
/// `acquire` prefers the calling thread's cache (no lock) and falls back to
/// the global free list. Dropped `PooledBuffer`s are reset and returned the
/// same way. Buffers handed out by the pool hold no other live reference.
#[derive(Debug)]
pub struct BufferPool {
    global: Mutex<Vec<Buffer>>,
    cached: AtomicUsize,
    max_cached: usize,
    default_capacity: usize,
}

impl BufferPool {
    pub fn new(max_cached: usize, default_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            global: Mutex::new(Vec::new()),
            cached: AtomicUsize::new(0),
            max_cached: max_cached.max(1),
            default_capacity: default_capacity.max(256),
        })
    }

    /// Take a buffer with at least `min_writable` writable bytes.
    pub fn acquire(self: &Arc<Self>, min_writable: usize) -> PooledBuffer {
        let mut buf = self
            .take_thread_local()
            .or_else(|| self.take_global())
            .unwrap_or_else(|| Buffer::new(self.default_capacity));
        buf.clear();
        if min_writable > 0 {
            buf.ensure_writable(min_writable);
        }
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Pre-populate the global tier, up to the cache bound.
    pub fn warmup(&self, count: usize, capacity_hint: usize) {
        let mut global = self.global.lock().expect("buffer pool poisoned");
        let cached = self.cached.load(Ordering::Relaxed);
        let room = self.max_cached.saturating_sub(cached);
        let count = count.min(room);
        for _ in 0..count {
            global.push(Buffer::new(capacity_hint.max(self.default_capacity)));
        }
        self.cached.fetch_add(count, Ordering::Relaxed);
    }

    /// Buffers currently held by the global tier.
    pub fn cached_count(&self) -> usize {
        self.cached.load(Ordering::Relaxed)
    }

    pub fn max_cached(&self) -> usize {
        self.max_cached
    }

    fn take_thread_local(&self) -> Option<Buffer> {
        THREAD_CACHE.with(|cache| cache.borrow_mut().pop())
    }

    fn take_global(&self) -> Option<Buffer> {
        let mut global = self.global.lock().expect("buffer pool poisoned");
        let buf = global.pop();
        if buf.is_some() {
            self.cached.fetch_sub(1, Ordering::Relaxed);
        }
        buf
    }

    fn release(&self, mut buf: Buffer) {
        buf.clear();
        let overflow = THREAD_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.len() < THREAD_CACHE_SLOTS {
                cache.push(buf);
                None
            } else {
                Some(buf)
            }
        });
        if let Some(buf) = overflow {
            let mut global = self.global.lock().expect("buffer pool poisoned");
            if self.cached.load(Ordering::Relaxed) < self.max_cached {
                global.push(buf);
                self.cached.fetch_add(1, Ordering::Relaxed);
            }
            // Otherwise the buffer is simply dropped.
        }
    }
}

/// Guard that returns its buffer to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Buffer>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_meets_min_writable() {
        let pool = BufferPool::new(4, 256);
        let buf = pool.acquire(4096);
        assert!(buf.writable_bytes() >= 4096);
    }

    #[test]
    fn released_buffers_are_reset() {
        let pool = BufferPool::new(4, 256);
        {
            let mut buf = pool.acquire(16);
            buf.append(b"leftover");
        }
        let buf = pool.acquire(16);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn global_tier_respects_bound() {
        let pool = BufferPool::new(2, 256);
        pool.warmup(10, 256);
        assert_eq!(pool.cached_count(), 2);
    }

    #[test]
    fn thread_cache_overflow_lands_in_global() {
        let pool = BufferPool::new(64, 256);
        // Hold more buffers than the thread cache can take back.
        let held: Vec<_> = (0..THREAD_CACHE_SLOTS + 3).map(|_| pool.acquire(16)).collect();
        drop(held);
        let buf = pool.acquire(16);
        assert_eq!(buf.readable_bytes(), 0);
    }
}
