//! On-disk transaction layout: subvolume paths, marker files, and the
//! `dirty` list wire format.
//!
//! Every transaction gets a `trans_<id>/`
//! directory holding the cached blocks plus a handful of marker files
//! that record where the transaction is in its lifecycle. None of these
//! markers carry a payload beyond their presence, except `dirty` and its
//! `.mem`/`.evicted`/`.submitted` siblings, which hold a keyed record
//! stream checksummed with [`crate::codec::adler32`].

use crate::codec::adler32;
use crate::error::{CacheError, CacheResult};
use crate::key::{Key, TransId};
use std::path::PathBuf;

pub const LOCK_FILE: &str = "lock";
pub const DIRTY_FILE: &str = "dirty";
pub const DIRTY_MEM_SUFFIX: &str = ".mem";
pub const DIRTY_EVICTED_FILE: &str = "dirty.evicted";
pub const DIRTY_SUBMITTED_FILE: &str = "dirty.submitted";
pub const DIRTY_NOSUBMIT_FILE: &str = "dirty.nosubmit";
pub const DELETED_FILE: &str = "deleted";
pub const COMMITED_FILE: &str = "commited";
pub const INVALID_FILE: &str = "invalid";
pub const COMP_SUFFIX: &str = ".comp";
pub const MISSING_PREFIX: &str = "missing_";
pub const RESET_UNREADABLE_MARKER: &str = "clouddrive_reset_unreadable";
pub const RESET_RETRIES_MARKER: &str = "clouddrive_reset_retries";

/// The `trans_<id>` subvolume directory for a transaction.
pub fn trans_dir(transid: TransId) -> PathBuf {
    PathBuf::from(format!("trans_{}", transid.0))
}

/// `trans_<id>/<first-4-hex>/<full-hex>`, the uncompressed block path.
pub fn block_path(transid: TransId, key: &Key) -> PathBuf {
    trans_dir(transid).join(key.shard_prefix()).join(key.to_hex())
}

/// `trans_<id>/<first-4-hex>/<full-hex>.comp`, the compressed sibling.
pub fn comp_path(transid: TransId, key: &Key) -> PathBuf {
    let mut p = block_path(transid, key).into_os_string();
    p.push(COMP_SUFFIX);
    PathBuf::from(p)
}

pub fn missing_marker(key: &Key) -> PathBuf {
    PathBuf::from(format!("{MISSING_PREFIX}{}", key.to_hex()))
}

/// A single record in a `dirty` (or `.evicted`/`.submitted`) file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRecord {
    pub key: Key,
    /// `0` = uncompressed, `1` = compressed, `2` = dirty-but-evicted.
    pub compressed_flag: u8,
}

impl DirtyRecord {
    pub fn plain(key: Key) -> Self {
        Self { key, compressed_flag: 0 }
    }

    pub fn compressed(key: Key) -> Self {
        Self { key, compressed_flag: 1 }
    }

    pub fn dirty_evicted(key: Key) -> Self {
        Self { key, compressed_flag: 2 }
    }
}

/// Serialize a stream of `(u8 compressed_flag, u32 keysize_le, keybytes)`
/// records, each followed by a `u32_le` adler32 of the record body
/// (flag byte + length prefix + key bytes).
pub fn encode_dirty_list(records: &[DirtyRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for rec in records {
        let mut body = Vec::with_capacity(5 + rec.key.as_bytes().len());
        body.push(rec.compressed_flag);
        body.extend_from_slice(&(rec.key.as_bytes().len() as u32).to_le_bytes());
        body.extend_from_slice(rec.key.as_bytes());
        let checksum = adler32(&body);
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum.to_le_bytes());
    }
    out
}

/// Parse a `dirty`-format byte stream, verifying each record's checksum.
/// Stops (and returns what was parsed so far as an error) at the first
/// corrupt record, matching the "checksum mismatch on `dirty` file" error
/// kind.
pub fn decode_dirty_list(data: &[u8]) -> CacheResult<Vec<DirtyRecord>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 5 > data.len() {
            return Err(CacheError::Integrity("truncated dirty record header".into()));
        }
        let flag = data[pos];
        let keysize = u32::from_le_bytes(data[pos + 1..pos + 5].try_into().unwrap()) as usize;
        let body_end = pos + 5 + keysize;
        if body_end + 4 > data.len() {
            return Err(CacheError::Integrity("truncated dirty record body".into()));
        }
        let body = &data[pos..body_end];
        let checksum = u32::from_le_bytes(data[body_end..body_end + 4].try_into().unwrap());
        if adler32(body) != checksum {
            return Err(CacheError::Integrity(format!(
                "dirty list checksum mismatch at offset {pos}"
            )));
        }
        let key = Key::from(body[5..].to_vec());
        out.push(DirtyRecord { key, compressed_flag: flag });
        pos = body_end + 4;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_path_uses_shard_prefix() {
        let key = Key::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let path = block_path(TransId(7), &key);
        assert_eq!(path, PathBuf::from("trans_7/dead/deadbeef"));
    }

    #[test]
    fn comp_path_appends_suffix() {
        let key = Key::from(vec![1, 2]);
        let path = comp_path(TransId(1), &key);
        assert_eq!(path, PathBuf::from("trans_1/0102/0102.comp"));
    }

    #[test]
    fn dirty_list_roundtrips() {
        let records = vec![
            DirtyRecord::plain(Key::from(vec![1, 2, 3])),
            DirtyRecord::compressed(Key::from(vec![4, 5])),
            DirtyRecord::dirty_evicted(Key::from(vec![6])),
        ];
        let encoded = encode_dirty_list(&records);
        let decoded = decode_dirty_list(&encoded).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn dirty_list_detects_corruption() {
        let records = vec![DirtyRecord::plain(Key::from(vec![9, 9]))];
        let mut encoded = encode_dirty_list(&records);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(decode_dirty_list(&encoded).is_err());
    }

    #[test]
    fn empty_list_roundtrips() {
        assert!(decode_dirty_list(&encode_dirty_list(&[])).unwrap().is_empty());
    }
}
