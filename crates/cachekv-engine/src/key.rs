//! Opaque cache keys and transaction identifiers

use bytes::Bytes;
use std::fmt;

/// An opaque block identifier.
///
/// Keys are usually 8-32 bytes. They carry no structure the engine
/// interprets; only the hex encoding (used for on-disk filenames and
/// log lines) and raw bytes (used for backend calls) matter.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Lowercase hex encoding, as used for `trans_<id>/<first-4-hex>/<full-hex>`.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(Bytes::from(hex::decode(s)?)))
    }

    /// First 4 hex characters, used as the on-disk shard directory name.
    pub fn shard_prefix(&self) -> String {
        let hex = self.to_hex();
        if hex.len() >= 4 {
            hex[..4].to_string()
        } else {
            hex
        }
    }

    /// The sentinel empty key used by `checkpoint` to serialize with all
    /// in-flight retrievals rather than a specific one.
    pub fn checkpoint_sentinel() -> Self {
        Self(Bytes::new())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Self::new(b)
    }
}

/// Monotonic, backend-issued transaction id. `TransId(0)` means "unknown"
/// (mirrors `BlockStore::get_transid` returning 0 as a false-negative-safe
/// sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransId(pub u64);

impl TransId {
    pub const UNKNOWN: TransId = TransId(0);

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-entry "second chance" counter used by the eviction policy.
///
/// Clamped to `0..=127` (a 7-bit counter, per the data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Chances(u8);

impl Chances {
    pub const MAX: u8 = 127;

    pub fn new(n: u8) -> Self {
        Self(n.min(Self::MAX))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Decrement, saturating at zero. Returns the new value.
    pub fn decrement(&mut self) -> u8 {
        self.0 = self.0.saturating_sub(1);
        self.0
    }

    pub fn has_chances(self) -> bool {
        self.0 > 0
    }
}

/// Caller's hint to `get` about whether the backend is expected to have
/// `key`. `Present` enables the retry-then-`reset()` path on a persistent
/// miss; `Unknown` treats a miss as ordinary not-found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitmapHint {
    Present,
    #[default]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = Key::from(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(key.to_hex(), "deadbeef");
        assert_eq!(Key::from_hex("deadbeef").unwrap(), key);
    }

    #[test]
    fn shard_prefix_is_first_four_hex_chars() {
        let key = Key::from(vec![0x01, 0x23, 0x45]);
        assert_eq!(key.shard_prefix(), "0123");
    }

    #[test]
    fn chances_clamp_to_127() {
        assert_eq!(Chances::new(200).get(), 127);
        let mut c = Chances::new(1);
        assert_eq!(c.decrement(), 0);
        assert_eq!(c.decrement(), 0);
    }

    #[test]
    fn transid_unknown_is_zero() {
        assert!(TransId::UNKNOWN.is_unknown());
        assert!(!TransId(7).is_unknown());
    }
}
