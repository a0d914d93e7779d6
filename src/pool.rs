// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Process-wide pool of growable byte buffers.
//!
//! Every section read off a CAR stream lands in a [`PooledBuf`] so that the
//! framer, the accumulator and the flusher recycle allocations instead of
//! churning the allocator at stream rate. Handles are move-only; the buffer
//! returns to the pool when the handle is dropped or explicitly [`put`].
//!
//! [`put`]: BufferPool::put

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The global pool used by the CAR readers.
pub static BUFFER_POOL: BufferPool = BufferPool::new();

/// A free list of `Vec<u8>` buffers. `get` hands out a cleared buffer with
/// whatever capacity it retired with; `put` recycles it.
pub struct BufferPool {
    shelf: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Take a buffer from the pool, allocating a fresh one if the shelf is
    /// empty. The returned buffer is always empty; capacity is whatever the
    /// previous user grew it to.
    pub fn get(&self) -> PooledBuf {
        let buf = self.shelf.lock().pop().unwrap_or_default();
        debug_assert!(buf.is_empty());
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuf { buf: Some(buf) }
    }

    /// Return a buffer to the pool. Equivalent to dropping the handle.
    pub fn put(&self, buf: PooledBuf) {
        drop(buf);
    }

    /// Number of buffers currently held outside the pool. Zero once every
    /// consumer has returned its handle.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn put_vec(&self, mut buf: Vec<u8>) {
        buf.clear();
        let prev = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "buffer returned to pool more than once");
        self.shelf.lock().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusively-owned buffer borrowed from [`BUFFER_POOL`].
///
/// Dereferences to the inner `Vec<u8>`. Dropping the handle returns the
/// buffer to the pool.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        self
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer already returned")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer already returned")
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            BUFFER_POOL.put_vec(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn get_put_accounting() {
        let base = BUFFER_POOL.outstanding();
        let mut a = BUFFER_POOL.get();
        let b = BUFFER_POOL.get();
        assert_eq!(BUFFER_POOL.outstanding(), base + 2);

        a.extend_from_slice(b"some section bytes");
        assert_eq!(a.as_slice(), b"some section bytes");

        BUFFER_POOL.put(a);
        drop(b);
        assert_eq!(BUFFER_POOL.outstanding(), base);
    }

    #[test]
    #[serial]
    fn recycled_buffer_is_cleared() {
        let mut a = BUFFER_POOL.get();
        a.extend_from_slice(&[1, 2, 3]);
        drop(a);
        let b = BUFFER_POOL.get();
        assert!(b.is_empty());
        drop(b);
    }
}
