//! The remote object store the cache engine fronts
//!
//! Mirrors `IOnlineKvStore` field for field: every call the engine makes
//! against the backend is a method here. Implementations are expected to
//! retry internally where the original contract allows a false negative
//! (e.g. `get_transid` returning `TransId::UNKNOWN`) and to surface hard
//! failures as `Err`.

use crate::error::CacheResult;
use crate::key::{Key, TransId};
use std::io::Read;

/// Callback the backend uses during `submit_del` to ask "is this key still
/// referenced locally", letting it skip deleting keys that were re-written
/// after the delete was queued.
pub trait HasKeyCallback: Send + Sync {
    fn has_key(&self, key: &Key) -> bool;
}

/// The remote object store.
///
/// All methods that can fail for transient reasons (network, backend
/// overload) are expected to be retried by the caller using the capped
/// exponential backoff described in the transaction lifecycle design;
/// this trait's `Err` return means "permanent failure for this attempt,"
/// not "never retry."
pub trait BlockStore: Send + Sync {
    /// Fetch `key` as it existed at `transid` (or the latest committed
    /// version if `transid` is `TransId::UNKNOWN`). `prioritize_read` asks
    /// the backend to service this read ahead of background traffic.
    /// Returns `(reader, not_found, served_transid)`.
    fn get(
        &self,
        key: &Key,
        transid: TransId,
        prioritize_read: bool,
    ) -> CacheResult<(Box<dyn Read + Send>, bool, TransId)>;

    /// The transid a key was last written at, or `TransId::UNKNOWN` if the
    /// backend doesn't track this (a permitted false negative).
    fn get_transid(&self, key: &Key, transid: TransId) -> TransId;

    /// Clears any backend-side negative cache for `key`, forcing the next
    /// `get` to re-check existence.
    fn reset(&self, key: &Key, transid: TransId) -> bool;

    /// Upload `src` as `key` at `transid`. `flags` is an OR of
    /// [`PutFlags::already_compressed_encrypted`]/[`PutFlags::metadata`]
    /// translated to the backend's own bit values. Returns the stored
    /// (possibly backend-recompressed) size.
    fn put(
        &self,
        key: &Key,
        transid: TransId,
        src: &mut dyn Read,
        already_compressed_encrypted: bool,
        metadata: bool,
    ) -> CacheResult<u64>;

    /// Allocate a new transaction id.
    fn new_transaction(&self) -> CacheResult<TransId>;

    /// Commit or abort `transid`. `complete` selects commit vs. abort.
    fn transaction_finalize(&self, transid: TransId, complete: bool) -> CacheResult<()>;

    /// Tell the backend which transactions are still open, so it can
    /// reclaim storage for anything older that's no longer referenced.
    fn set_active_transactions(&self, active: &[TransId]) -> CacheResult<()>;

    /// Batch-delete `keys` at `transid`.
    fn del(&self, keys: &[Key], transid: TransId) -> CacheResult<()>;

    /// Largest batch size accepted by `del`.
    fn max_del_size(&self) -> usize;

    /// Monotonic backend generation counter, incremented by `inc`.
    fn generation_inc(&self, inc: i64) -> i64;

    /// Free-form backend statistics string (surfaced verbatim in engine stats).
    fn get_stats(&self) -> String;

    /// Flush all pending writes to stable storage.
    fn sync(&self) -> CacheResult<()>;

    /// Flush only the backend's metadata database.
    fn sync_db(&self) -> CacheResult<()>;

    /// Whether `put` only returns after the backend has durably stored
    /// the object (vs. queuing it for eventual upload).
    fn is_put_sync(&self) -> bool;

    /// Free-form backend memory-usage string (surfaced in engine stats).
    fn meminfo(&self) -> String;

    /// Check whether `key` exists at the backend at all, optionally
    /// refreshing the backend's cached MD5 for it.
    fn has_backend_key(&self, key: &Key, update_md5sum: bool) -> (bool, Option<String>);

    fn get_uploaded_bytes(&self) -> u64;

    fn get_downloaded_bytes(&self) -> u64;

    /// Whether the backend wants metadata blocks routed through `put`'s
    /// metadata path rather than the ordinary data path.
    fn want_put_metadata(&self) -> bool;

    /// Selects the retry cadence for writes: `true` means a flat 1s retry
    /// on the first attempt before falling back to exponential backoff.
    fn fast_write_retry(&self) -> bool;

    /// Ask the backend to delete keys no longer referenced locally,
    /// consulting `has_key_callback` to avoid racing a concurrent rewrite.
    /// Returns whether the caller must flush before the delete is durable.
    fn submit_del(
        &self,
        has_key_callback: &dyn HasKeyCallback,
        ctransid: TransId,
    ) -> CacheResult<bool>;

    /// Called after the flush `submit_del` requested has completed.
    fn submit_del_post_flush(&self);
}

/// In-memory `BlockStore` used by tests and the demo binary.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

    struct Object {
        data: Vec<u8>,
        transid: TransId,
    }

    /// A trivial in-process backend: every `put` is immediately durable,
    /// `get` never fails for a present key, and generations/bytes are
    /// tracked with atomics for inspection in tests.
    pub struct MockBlockStore {
        objects: Mutex<HashMap<Vec<u8>, Object>>,
        next_transid: AtomicI64,
        generation: AtomicI64,
        uploaded: AtomicU64,
        downloaded: AtomicU64,
        put_sync: bool,
        fast_retry: bool,
    }

    impl MockBlockStore {
        pub fn new() -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                next_transid: AtomicI64::new(1),
                generation: AtomicI64::new(0),
                uploaded: AtomicU64::new(0),
                downloaded: AtomicU64::new(0),
                put_sync: true,
                fast_retry: true,
            }
        }

        pub fn contains(&self, key: &Key) -> bool {
            self.objects.lock().contains_key(key.as_bytes())
        }
    }

    impl Default for MockBlockStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BlockStore for MockBlockStore {
        fn get(
            &self,
            key: &Key,
            _transid: TransId,
            _prioritize_read: bool,
        ) -> CacheResult<(Box<dyn Read + Send>, bool, TransId)> {
            let objects = self.objects.lock();
            match objects.get(key.as_bytes()) {
                Some(obj) => {
                    self.downloaded.fetch_add(obj.data.len() as u64, Ordering::Relaxed);
                    Ok((Box::new(Cursor::new(obj.data.clone())), false, obj.transid))
                }
                None => Ok((Box::new(Cursor::new(Vec::new())), true, TransId::UNKNOWN)),
            }
        }

        fn get_transid(&self, key: &Key, _transid: TransId) -> TransId {
            self.objects
                .lock()
                .get(key.as_bytes())
                .map(|o| o.transid)
                .unwrap_or(TransId::UNKNOWN)
        }

        fn reset(&self, _key: &Key, _transid: TransId) -> bool {
            true
        }

        fn put(
            &self,
            key: &Key,
            transid: TransId,
            src: &mut dyn Read,
            _already_compressed_encrypted: bool,
            _metadata: bool,
        ) -> CacheResult<u64> {
            let mut data = Vec::new();
            src.read_to_end(&mut data)?;
            let len = data.len() as u64;
            self.uploaded.fetch_add(len, Ordering::Relaxed);
            self.objects
                .lock()
                .insert(key.as_bytes().to_vec(), Object { data, transid });
            Ok(len)
        }

        fn new_transaction(&self) -> CacheResult<TransId> {
            Ok(TransId(self.next_transid.fetch_add(1, Ordering::Relaxed) as u64))
        }

        fn transaction_finalize(&self, _transid: TransId, _complete: bool) -> CacheResult<()> {
            Ok(())
        }

        fn set_active_transactions(&self, _active: &[TransId]) -> CacheResult<()> {
            Ok(())
        }

        fn del(&self, keys: &[Key], _transid: TransId) -> CacheResult<()> {
            let mut objects = self.objects.lock();
            for key in keys {
                objects.remove(key.as_bytes());
            }
            Ok(())
        }

        fn max_del_size(&self) -> usize {
            1000
        }

        fn generation_inc(&self, inc: i64) -> i64 {
            self.generation.fetch_add(inc, Ordering::Relaxed) + inc
        }

        fn get_stats(&self) -> String {
            format!("objects={}", self.objects.lock().len())
        }

        fn sync(&self) -> CacheResult<()> {
            Ok(())
        }

        fn sync_db(&self) -> CacheResult<()> {
            Ok(())
        }

        fn is_put_sync(&self) -> bool {
            self.put_sync
        }

        fn meminfo(&self) -> String {
            "mock".to_string()
        }

        fn has_backend_key(&self, key: &Key, _update_md5sum: bool) -> (bool, Option<String>) {
            (self.contains(key), None)
        }

        fn get_uploaded_bytes(&self) -> u64 {
            self.uploaded.load(Ordering::Relaxed)
        }

        fn get_downloaded_bytes(&self) -> u64 {
            self.downloaded.load(Ordering::Relaxed)
        }

        fn want_put_metadata(&self) -> bool {
            false
        }

        fn fast_write_retry(&self) -> bool {
            self.fast_retry
        }

        fn submit_del(
            &self,
            has_key_callback: &dyn HasKeyCallback,
            transid: TransId,
        ) -> CacheResult<bool> {
            let pending: Vec<Key> = self
                .objects
                .lock()
                .keys()
                .map(|k| Key::from(k.clone()))
                .filter(|k| !has_key_callback.has_key(k))
                .collect();
            self.del(&pending, transid)?;
            Ok(false)
        }

        fn submit_del_post_flush(&self) {}
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct AlwaysAbsent;
        impl HasKeyCallback for AlwaysAbsent {
            fn has_key(&self, _key: &Key) -> bool {
                false
            }
        }

        #[test]
        fn put_then_get_roundtrips() {
            let store = MockBlockStore::new();
            let key = Key::from(vec![1, 2, 3]);
            let mut src = Cursor::new(b"hello".to_vec());
            store.put(&key, TransId(1), &mut src, false, false).unwrap();

            let (mut reader, not_found, transid) = store.get(&key, TransId::UNKNOWN, false).unwrap();
            assert!(!not_found);
            assert_eq!(transid, TransId(1));
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).unwrap();
            assert_eq!(buf, b"hello");
        }

        #[test]
        fn get_missing_key_reports_not_found() {
            let store = MockBlockStore::new();
            let key = Key::from(vec![9, 9]);
            let (_, not_found, transid) = store.get(&key, TransId::UNKNOWN, false).unwrap();
            assert!(not_found);
            assert!(transid.is_unknown());
        }

        #[test]
        fn submit_del_removes_unreferenced_keys() {
            let store = MockBlockStore::new();
            let key = Key::from(vec![7]);
            let mut src = Cursor::new(b"x".to_vec());
            store.put(&key, TransId(1), &mut src, false, false).unwrap();
            store.submit_del(&AlwaysAbsent, TransId(1)).unwrap();
            assert!(!store.contains(&key));
        }
    }
}
