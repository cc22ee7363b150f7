//! Compression/encryption codec contract
//!
//! Mirrors `ICompressAndEncrypt`/`IDecryptAndDecompress`: compress on the
//! way to the backend, decompress (and verify) on the way back. The
//! engine never interprets compressed bytes itself, only the framing
//! (`md5 || payload`) that lets it verify integrity without a codec.

use crate::config::CodecId;
use crate::error::{CacheError, CacheResult};
use md5::{Digest, Md5};

/// A pluggable compressor/encryptor.
///
/// Implementations own both compression and (optionally) encryption;
/// the engine only calls `compress`/`decompress` and treats the result
/// as opaque bytes framed with an MD5 digest.
pub trait Codec: Send + Sync {
    /// Compress (and possibly encrypt) `data`, returning the wire payload
    /// with no MD5 framing — the caller adds that.
    fn compress(&self, data: &[u8], method: CodecId) -> CacheResult<Vec<u8>>;

    /// Inverse of `compress`.
    fn decompress(&self, data: &[u8]) -> CacheResult<Vec<u8>>;

    /// Identifies this codec's default method, used when none is specified.
    fn default_method(&self) -> CodecId;
}

/// Prefixes `payload` with its 16-byte MD5 digest, as required for
/// `.comp` files (16-byte MD5 || payload).
pub fn frame_with_md5(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&md5_digest(payload));
    out.extend_from_slice(payload);
    out
}

/// Splits a framed buffer back into `(digest, payload)` and verifies it.
pub fn unframe_and_verify(framed: &[u8]) -> CacheResult<&[u8]> {
    if framed.len() < 16 {
        return Err(CacheError::Integrity("framed buffer shorter than md5 header".into()));
    }
    let (digest, payload) = framed.split_at(16);
    let actual = md5_digest(payload);
    if actual != digest {
        return Err(CacheError::Integrity("md5 mismatch on compressed block".into()));
    }
    Ok(payload)
}

fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Adler-32 checksum, used for `dirty` record integrity.
///
/// Grounded in the original `common/adler32.h`: the classic two-sum
/// rolling checksum with modulus 65521, processed in chunks to avoid
/// overflow of the running sums before the modulo reduction.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    // 5552 is the largest chunk where `a` cannot overflow a u32 before
    // the next reduction, for bytes in 0..=255.
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

/// Default `Codec` implementation backed by `zstd`.
///
/// Only the zstd family of method ids is actually implemented; other
/// method ids are accepted on decompress (for reading blocks written by
/// a different codec configuration) but rejected on compress.
pub struct ZstdCodec {
    default_method: CodecId,
}

impl ZstdCodec {
    pub fn new(default_method: CodecId) -> Self {
        Self { default_method }
    }

    fn level_for(method: CodecId) -> CacheResult<i32> {
        match method {
            CodecId::Zstd3 => Ok(3),
            CodecId::Zstd7 => Ok(7),
            CodecId::Zstd9 => Ok(9),
            CodecId::Zstd19 => Ok(19),
            CodecId::None => Ok(0),
            other => Err(CacheError::Configuration(format!(
                "ZstdCodec cannot compress with method {other:?}"
            ))),
        }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(CodecId::Zstd3)
    }
}

impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8], method: CodecId) -> CacheResult<Vec<u8>> {
        if matches!(method, CodecId::None) {
            return Ok(data.to_vec());
        }
        let level = Self::level_for(method)?;
        zstd::stream::encode_all(data, level).map_err(CacheError::Io)
    }

    fn decompress(&self, data: &[u8]) -> CacheResult<Vec<u8>> {
        zstd::stream::decode_all(data).map_err(CacheError::Io)
    }

    fn default_method(&self) -> CodecId {
        self.default_method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_matches_known_vector() {
        // "Wikipedia" -> 0x11E60398 per the reference worked example.
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn adler32_empty_is_one() {
        assert_eq!(adler32(b""), 1);
    }

    #[test]
    fn md5_frame_roundtrips() {
        let payload = b"hello cache engine";
        let framed = frame_with_md5(payload);
        let unframed = unframe_and_verify(&framed).unwrap();
        assert_eq!(unframed, payload);
    }

    #[test]
    fn md5_frame_detects_corruption() {
        let mut framed = frame_with_md5(b"payload");
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        assert!(unframe_and_verify(&framed).is_err());
    }

    #[test]
    fn zstd_codec_roundtrips() {
        let codec = ZstdCodec::default();
        let data = b"some data worth compressing, repeated, repeated, repeated".to_vec();
        let compressed = codec.compress(&data, CodecId::Zstd3).unwrap();
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn zstd_codec_rejects_non_zstd_compress() {
        let codec = ZstdCodec::default();
        assert!(codec.compress(b"x", CodecId::Lzma5).is_err());
    }
}
