//! The local filesystem the cache uses for its own storage
//!
//! Abstracts plain files, directories, subvolume/snapshot creation,
//! reflinks, and free-space queries so the engine can be tested against
//! an in-memory or tempdir-backed implementation instead of requiring a
//! real btrfs-like filesystem.

use crate::error::CacheResult;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Free-space accounting for the cache filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FreeSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub free_metadata_bytes: u64,
}

/// A file handle opened against the cache filesystem.
pub trait CacheFile: Read + Write + Seek + Send {
    fn sync_all(&mut self) -> CacheResult<()>;
    fn set_len(&mut self, len: u64) -> CacheResult<()>;
    fn len(&self) -> CacheResult<u64>;
}

/// The local filesystem abstraction the engine stores cache state on.
///
/// Every method takes paths relative to the cache root; implementations
/// are responsible for resolving them underneath wherever the cache is
/// actually rooted.
pub trait CacheFs: Send + Sync {
    fn open_read(&self, path: &Path) -> CacheResult<Box<dyn CacheFile>>;
    fn open_write(&self, path: &Path, create: bool) -> CacheResult<Box<dyn CacheFile>>;
    fn exists(&self, path: &Path) -> bool;
    fn remove_file(&self, path: &Path) -> CacheResult<()>;
    fn create_dir_all(&self, path: &Path) -> CacheResult<()>;
    fn remove_dir_all(&self, path: &Path) -> CacheResult<()>;
    fn read_dir(&self, path: &Path) -> CacheResult<Vec<PathBuf>>;
    fn rename(&self, from: &Path, to: &Path) -> CacheResult<()>;

    /// Create `snapshot` as a copy-on-write snapshot of `base` (a
    /// transaction's subvolume), used to derive a new transaction's
    /// working tree from a previously committed one.
    fn snapshot(&self, base: &Path, snapshot: &Path) -> CacheResult<()>;

    /// Reflink `dst` to share storage with `src` where the filesystem
    /// supports it; implementations without reflink support may fall back
    /// to a full copy.
    fn reflink(&self, src: &Path, dst: &Path) -> CacheResult<()>;

    fn free_space(&self) -> CacheResult<FreeSpace>;

    fn get_xattr(&self, path: &Path, name: &str) -> CacheResult<Option<Vec<u8>>>;
    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> CacheResult<()>;

    /// Rebalance space between the data and metadata allocations
    /// underlying the filesystem, used by the metadata-update loop when
    /// `free_metadata_bytes` runs low relative to `free_bytes`. A no-op
    /// on filesystems without a separate metadata allocation.
    fn balance(&self) -> CacheResult<()>;

    /// Force-allocate additional metadata chunks ahead of need, used as a
    /// last resort when `balance` alone cannot free enough metadata space.
    /// Returns the number of bytes newly reserved for metadata.
    fn force_alloc_metadata(&self, min_bytes: u64) -> CacheResult<u64>;
}

/// `CacheFs` implementation backed by `std::fs`, rooted at a real
/// directory. Snapshot/reflink degrade to recursive copy since the
/// engine's correctness does not depend on them being zero-copy, only
/// on the resulting tree being independent of the source afterward.
pub mod local {
    use super::*;
    use std::fs::{self, File, OpenOptions};

    pub struct LocalCacheFs {
        root: PathBuf,
    }

    impl LocalCacheFs {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        fn resolve(&self, path: &Path) -> PathBuf {
            self.root.join(path)
        }
    }

    impl CacheFile for File {
        fn sync_all(&mut self) -> CacheResult<()> {
            File::sync_all(self).map_err(Into::into)
        }

        fn set_len(&mut self, len: u64) -> CacheResult<()> {
            File::set_len(self, len).map_err(Into::into)
        }

        fn len(&self) -> CacheResult<u64> {
            Ok(self.metadata()?.len())
        }
    }

    impl CacheFs for LocalCacheFs {
        fn open_read(&self, path: &Path) -> CacheResult<Box<dyn CacheFile>> {
            Ok(Box::new(File::open(self.resolve(path))?))
        }

        fn open_write(&self, path: &Path, create: bool) -> CacheResult<Box<dyn CacheFile>> {
            let full = self.resolve(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(full)?;
            Ok(Box::new(file))
        }

        fn exists(&self, path: &Path) -> bool {
            self.resolve(path).exists()
        }

        fn remove_file(&self, path: &Path) -> CacheResult<()> {
            fs::remove_file(self.resolve(path)).map_err(Into::into)
        }

        fn create_dir_all(&self, path: &Path) -> CacheResult<()> {
            fs::create_dir_all(self.resolve(path)).map_err(Into::into)
        }

        fn remove_dir_all(&self, path: &Path) -> CacheResult<()> {
            let full = self.resolve(path);
            if full.exists() {
                fs::remove_dir_all(full)?;
            }
            Ok(())
        }

        fn read_dir(&self, path: &Path) -> CacheResult<Vec<PathBuf>> {
            let full = self.resolve(path);
            if !full.exists() {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            for entry in fs::read_dir(full)? {
                let entry = entry?;
                out.push(entry.path().strip_prefix(&self.root).unwrap_or(&entry.path()).to_path_buf());
            }
            Ok(out)
        }

        fn rename(&self, from: &Path, to: &Path) -> CacheResult<()> {
            let to_full = self.resolve(to);
            if let Some(parent) = to_full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(self.resolve(from), to_full).map_err(Into::into)
        }

        fn snapshot(&self, base: &Path, snapshot: &Path) -> CacheResult<()> {
            copy_dir_recursive(&self.resolve(base), &self.resolve(snapshot))
        }

        fn reflink(&self, src: &Path, dst: &Path) -> CacheResult<()> {
            let dst_full = self.resolve(dst);
            if let Some(parent) = dst_full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(self.resolve(src), dst_full)?;
            Ok(())
        }

        fn free_space(&self) -> CacheResult<FreeSpace> {
            // `std` has no portable statvfs; report an optimistic constant
            // budget so tests exercising throttle/eviction math can still
            // drive free-space thresholds via config rather than the real disk.
            Ok(FreeSpace {
                free_bytes: u64::MAX / 2,
                total_bytes: u64::MAX / 2,
                free_metadata_bytes: u64::MAX / 2,
            })
        }

        fn get_xattr(&self, _path: &Path, _name: &str) -> CacheResult<Option<Vec<u8>>> {
            Ok(None)
        }

        fn set_xattr(&self, _path: &Path, _name: &str, _value: &[u8]) -> CacheResult<()> {
            Ok(())
        }

        fn balance(&self) -> CacheResult<()> {
            // `std::fs` has no notion of separate data/metadata chunk
            // allocations to rebalance between; nothing to do.
            Ok(())
        }

        fn force_alloc_metadata(&self, min_bytes: u64) -> CacheResult<u64> {
            Ok(min_bytes)
        }
    }

    fn copy_dir_recursive(src: &Path, dst: &Path) -> CacheResult<()> {
        fs::create_dir_all(dst)?;
        if !src.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let dst_path = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dst_path)?;
            } else {
                fs::copy(entry.path(), dst_path)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::{Read as _, Write as _};

        #[test]
        fn write_then_read_roundtrips() {
            let dir = tempfile::tempdir().unwrap();
            let fs = LocalCacheFs::new(dir.path());
            let path = Path::new("a/b.txt");
            let mut f = fs.open_write(path, true).unwrap();
            f.write_all(b"hello").unwrap();
            f.sync_all().unwrap();
            drop(f);

            let mut f = fs.open_read(path).unwrap();
            let mut buf = String::new();
            f.read_to_string(&mut buf).unwrap();
            assert_eq!(buf, "hello");
        }

        #[test]
        fn snapshot_copies_tree_independently() {
            let dir = tempfile::tempdir().unwrap();
            let fs = LocalCacheFs::new(dir.path());
            let base = Path::new("trans_1");
            fs.create_dir_all(base).unwrap();
            let mut f = fs.open_write(&base.join("item"), true).unwrap();
            f.write_all(b"v1").unwrap();
            drop(f);

            let snap = Path::new("trans_2");
            fs.snapshot(base, snap).unwrap();

            let mut f = fs.open_write(&base.join("item"), true).unwrap();
            f.write_all(b"v2-changed").unwrap();
            drop(f);

            let mut f = fs.open_read(&snap.join("item")).unwrap();
            let mut buf = String::new();
            f.read_to_string(&mut buf).unwrap();
            assert_eq!(buf, "v1");
        }

        #[test]
        fn remove_dir_all_on_missing_dir_is_ok() {
            let dir = tempfile::tempdir().unwrap();
            let fs = LocalCacheFs::new(dir.path());
            assert!(fs.remove_dir_all(Path::new("does-not-exist")).is_ok());
        }
    }
}
