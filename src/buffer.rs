use std::ops::{Deref, DerefMut};

use memmap2::MmapMut;
use tracing::debug;

/// Fixed-size scratch buffer, heap or anonymous-mmap backed.
pub enum PooledBuf {
    Heap(Vec<u8>),
    Mmap(MmapMut),
}

impl PooledBuf {
    /// Buffers of at least `mmap_threshold` bytes are mapped anonymously; a
    /// failed mapping falls back to the heap. A threshold of 0 disables mmap.
    pub fn alloc(size: usize, mmap_threshold: usize) -> Self {
        if mmap_threshold > 0 && size >= mmap_threshold {
            match MmapMut::map_anon(size) {
                Ok(map) => return PooledBuf::Mmap(map),
                Err(e) => debug!(size, error = %e, "anonymous mmap failed, using heap buffer"),
            }
        }
        PooledBuf::Heap(vec![0u8; size])
    }

    pub fn is_mmap(&self) -> bool {
        matches!(self, PooledBuf::Mmap(_))
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PooledBuf::Heap(buf) => buf,
            PooledBuf::Mmap(map) => map,
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            PooledBuf::Heap(buf) => buf,
            PooledBuf::Mmap(map) => map,
        }
    }
}

/// Free list of reusable items. Items are created on demand and never shrunk
/// until the pool is dropped.
pub(crate) struct Pool<T> {
    free: Vec<T>,
}

impl<T> Pool<T> {
    pub(crate) fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub(crate) fn get_or(&mut self, create: impl FnOnce() -> T) -> T {
        self.free.pop().unwrap_or_else(create)
    }

    pub(crate) fn put(&mut self, item: T) {
        self.free.push(item);
    }
}
