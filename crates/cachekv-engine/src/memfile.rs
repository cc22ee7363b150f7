//! In-memory file pool with copy-on-write sharing
//!
//! A `MemFile` backs a cached value with an in-memory buffer instead of a
//! cache-filesystem file, avoiding a disk round trip for hot, small, or
//! transient keys. Multiple transactions can share the same `MemFile`
//! (the later transaction is a snapshot of the earlier one); writing
//! through a shared handle copies first, so no transaction ever observes
//! another transaction's in-flight mutation.

use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    data: Vec<u8>,
}

/// A reference-counted, copy-on-write in-memory buffer.
///
/// Cloning a `MemFile` is cheap (an `Arc` bump) and produces a handle that
/// shares storage with the original until one side writes, at which point
/// the writer copies its own private buffer (`old_file` in the data
/// model's terms becomes the still-shared, now-stale `Arc`).
#[derive(Clone)]
pub struct MemFile {
    inner: Arc<RwLock<Inner>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner { data })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live handles sharing this buffer (including `self`).
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn read_all(&self) -> Vec<u8> {
        self.inner.read().data.clone()
    }

    /// Overwrite the buffer's contents. If this handle is shared with
    /// another transaction (`use_count() > 1`), the write first detaches
    /// this handle onto a private copy so the sibling keeps seeing the
    /// old bytes — the copy-on-write step.
    pub fn write_all(&mut self, data: Vec<u8>) {
        if self.use_count() > 1 {
            self.inner = Arc::new(RwLock::new(Inner { data }));
        } else {
            self.inner.write().data = data;
        }
    }

    /// True if `self` and `other` currently share the same backing buffer.
    pub fn shares_storage_with(&self, other: &MemFile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the set of memfiles currently backing cached values and enforces
/// the configured memory budget (`EngineConfig::memfile::max_memfile_size`).
pub struct MemFilePool {
    budget_bytes: u64,
    used_bytes: u64,
}

impl MemFilePool {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Whether a new memfile of `size` bytes would fit under budget.
    pub fn has_room_for(&self, size: u64) -> bool {
        self.budget_bytes > 0 && self.used_bytes.saturating_add(size) <= self.budget_bytes
    }

    /// Record that `size` additional bytes are now backed by a memfile.
    pub fn reserve(&mut self, size: u64) {
        self.used_bytes = self.used_bytes.saturating_add(size);
    }

    /// Release `size` bytes previously reserved (the memfile was dropped
    /// or materialized to the cache filesystem).
    pub fn release(&mut self, size: u64) {
        self.used_bytes = self.used_bytes.saturating_sub(size);
    }

    pub fn set_budget(&mut self, budget_bytes: u64) {
        self.budget_bytes = budget_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_storage_until_write() {
        let a = MemFile::from_bytes(b"v1".to_vec());
        let b = a.clone();
        assert!(a.shares_storage_with(&b));
        assert_eq!(a.use_count(), 2);

        let mut c = b.clone();
        c.write_all(b"v2".to_vec());
        assert!(!a.shares_storage_with(&c));
        assert_eq!(a.read_all(), b"v1");
        assert_eq!(c.read_all(), b"v2");
    }

    #[test]
    fn write_without_sharing_mutates_in_place() {
        let mut a = MemFile::from_bytes(b"v1".to_vec());
        let ptr_before = Arc::as_ptr(&a.inner);
        a.write_all(b"v2".to_vec());
        assert_eq!(Arc::as_ptr(&a.inner), ptr_before);
        assert_eq!(a.read_all(), b"v2");
    }

    #[test]
    fn pool_tracks_budget() {
        let mut pool = MemFilePool::new(100);
        assert!(pool.has_room_for(50));
        pool.reserve(80);
        assert!(!pool.has_room_for(50));
        pool.release(80);
        assert!(pool.has_room_for(50));
    }

    #[test]
    fn zero_budget_disables_memfiles() {
        let pool = MemFilePool::new(0);
        assert!(!pool.has_room_for(1));
    }
}
