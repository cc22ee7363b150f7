//! Rotating access-frequency bitmap
//!
//! A cheap heuristic for "has this key been written recently enough to be
//! worth routing through a memfile": a ring of fixed-size bit arrays, one
//! "generation" per rotation window. A key is considered hot if its bit is
//! set in any live generation. Rotating in a fresh all-zero generation and
//! dropping the oldest bounds memory use without needing per-key timestamps.

use crate::key::Key;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Default rotation period between generations.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);

/// Maximum number of live generations kept at once.
pub const MAX_GENERATIONS: usize = 8;

struct Generation {
    bits: Vec<u64>,
}

impl Generation {
    fn new(bit_len: usize) -> Self {
        Self {
            bits: vec![0u64; bit_len.div_ceil(64)],
        }
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 64] |= 1 << (idx % 64);
    }

    fn get(&self, idx: usize) -> bool {
        self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }
}

/// A ring of rotating bit arrays tracking recently-seen keys.
pub struct StatBitmap {
    bit_len: usize,
    generations: Vec<Generation>,
    max_generations: usize,
}

impl StatBitmap {
    pub fn new(bit_len: usize) -> Self {
        Self::with_max_generations(bit_len, MAX_GENERATIONS)
    }

    pub fn with_max_generations(bit_len: usize, max_generations: usize) -> Self {
        let bit_len = bit_len.max(1);
        Self {
            bit_len,
            generations: vec![Generation::new(bit_len)],
            max_generations: max_generations.max(1),
        }
    }

    fn slot(&self, key: &Key) -> usize {
        let mut hasher = DefaultHasher::new();
        key.as_bytes().hash(&mut hasher);
        (hasher.finish() as usize) % self.bit_len
    }

    /// Record that `key` was observed in the current generation.
    pub fn record(&mut self, key: &Key) {
        let slot = self.slot(key);
        self.generations.last_mut().unwrap().set(slot);
    }

    /// Whether `key` was observed in any live generation.
    pub fn is_hot(&self, key: &Key) -> bool {
        let slot = self.slot(key);
        self.generations.iter().any(|g| g.get(slot))
    }

    /// Start a new generation, dropping the oldest once the cap is reached.
    /// Called by the engine's background housekeeping roughly every
    /// [`ROTATION_PERIOD`].
    pub fn rotate(&mut self) {
        self.generations.push(Generation::new(self.bit_len));
        while self.generations.len() > self.max_generations {
            self.generations.remove(0);
        }
    }

    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> Key {
        Key::from(vec![n, n, n, n])
    }

    #[test]
    fn recorded_key_is_hot() {
        let mut bm = StatBitmap::new(1024);
        bm.record(&key(1));
        assert!(bm.is_hot(&key(1)));
    }

    #[test]
    fn unrecorded_key_is_usually_not_hot() {
        let bm = StatBitmap::new(1 << 20);
        assert!(!bm.is_hot(&key(42)));
    }

    #[test]
    fn rotation_caps_generation_count() {
        let mut bm = StatBitmap::with_max_generations(64, 3);
        for _ in 0..10 {
            bm.rotate();
        }
        assert_eq!(bm.generation_count(), 3);
    }

    #[test]
    fn old_generation_eventually_drops_out() {
        let mut bm = StatBitmap::with_max_generations(64, 2);
        bm.record(&key(5));
        assert!(bm.is_hot(&key(5)));
        bm.rotate();
        assert!(bm.is_hot(&key(5)), "still live in generation 2");
        bm.rotate();
        assert!(!bm.is_hot(&key(5)), "dropped after exceeding max_generations");
    }
}
