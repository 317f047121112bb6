//! Scratch buffer pool for the append path.
//!
//! Appends encode every entry into a staging buffer before it is written to
//! the segment file. Allocating a fresh buffer per entry would churn the
//! allocator on the hot path, so encoded entries are staged in pooled
//! `BytesMut` buffers instead. Read-side sharing needs no pool: `Bytes`
//! regions are already reference-counted and slicing one is the cursor.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use bytes::BytesMut;

/// Default number of buffers retained by a pool.
const POOL_CAPACITY_DEFAULT: usize = 16;

/// Default initial capacity of each pooled buffer (64 KiB).
const BUFFER_CAPACITY_DEFAULT: usize = 64 * 1024;

/// A bounded pool of reusable scratch buffers.
///
/// `acquire` hands out a [`PooledBuf`] guard; dropping the guard clears the
/// buffer and returns it to the free list. When the free list is full,
/// returned buffers are simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Creates a pool with default capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(POOL_CAPACITY_DEFAULT, BUFFER_CAPACITY_DEFAULT)
    }

    /// Creates a pool retaining at most `capacity` buffers of
    /// `buffer_capacity` initial bytes each.
    #[must_use]
    pub fn with_capacity(capacity: usize, buffer_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            buffer_capacity,
        }
    }

    /// Acquires a cleared buffer from the pool, allocating if none is free.
    pub fn acquire(&self) -> PooledBuf<'_> {
        let buf = {
            let mut free = self.free.lock().expect("pool lock poisoned");
            free.pop()
        };
        let buf = buf.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity));
        PooledBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    /// Returns the number of buffers currently on the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").len()
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().expect("pool lock poisoned");
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A scratch buffer borrowed from a [`BufferPool`].
///
/// Dereferences to `BytesMut`; returns itself to the pool on drop.
#[derive(Debug)]
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<BytesMut>,
}

impl Deref for PooledBuf<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
