//! Background eviction/compression loop.
//!
//! Runs once a second, mirroring [`throttle::ThrottleLoop`]'s shape: a
//! single OS thread recomputes the free-space/cache-size pressure signal
//! and walks the LRU tail via [`crate::engine::CacheEngine::eviction_step`]
//! until the target-miss condition clears or the per-pass depth budget is
//! exhausted. Compression candidates are drawn from the same tail on the
//! same cadence, gated by `comp_percent`/`comp_start_limit`.

use crate::engine::CacheEngine;
use crate::statbitmap::ROTATION_PERIOD;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Doubling cap so a sustained idle-worker signal can't run away and scan
/// the whole LRU every tick on a huge cache.
const MAX_DEPTH: usize = 1 << 20;

fn free_space_target_miss(engine: &CacheEngine) -> bool {
    let config = engine.config_snapshot();
    let Ok(mut free) = engine.free_space() else {
        return false;
    };
    // Bias free space down when free metadata space is tight.
    if free.free_metadata_bytes < config.cache.min_metadata_cache_free {
        free.free_bytes = free.free_bytes.saturating_sub(config.cache.min_metadata_cache_free);
    }
    let cachesize = engine.cachesize();
    (free.free_bytes < config.cache.min_free_size && cachesize >= config.cache.min_cachesize)
        || free.free_bytes < config.cache.critical_free_size
        || free.free_bytes < config.cache.throttle_free_size
        || cachesize > config.cache.max_cachesize_lower
}

fn compression_due(engine: &CacheEngine) -> bool {
    let config = engine.config_snapshot();
    if engine.compression_currently_disabled() {
        return false;
    }
    let (comp_bytes, cachesize) = engine.comp_bytes_and_cachesize();
    if cachesize == 0 || cachesize <= config.compression.comp_start_limit {
        return false;
    }
    let ratio = comp_bytes as f64 / cachesize as f64;
    ratio < config.compression.comp_percent
}

/// Auto-doubling depth counter shared between eviction and compression
/// passes (auto-doubles when a pass observed zero in-flight
/// evictions but the previous pass had completed evictions").
struct AdaptiveDepth {
    depth: AtomicUsize,
    prev_progress: AtomicUsize,
}

impl AdaptiveDepth {
    fn new(initial: usize) -> Self {
        Self {
            depth: AtomicUsize::new(initial.max(1)),
            prev_progress: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Record how many steps made progress this pass and adjust depth for
    /// the next one.
    fn record_pass(&self, progressed: usize, depth_exhausted: bool) {
        let prev = self.prev_progress.swap(progressed, Ordering::Relaxed);
        if progressed == 0 && prev > 0 && !depth_exhausted {
            let doubled = (self.depth.load(Ordering::Relaxed) * 2).min(MAX_DEPTH);
            self.depth.store(doubled, Ordering::Relaxed);
        }
    }
}

/// Background driver for eviction and background compression.
pub struct EvictionLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionLoop {
    pub fn spawn(engine: Arc<CacheEngine>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("cachekv-eviction".into())
            .spawn(move || run(engine, loop_stop))
            .expect("spawn eviction loop");
        Self { stop, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            h.join().ok();
        }
    }
}

fn run(engine: Arc<CacheEngine>, stop: Arc<AtomicBool>) {
    let evict_depth = AdaptiveDepth::new(engine.config_snapshot().eviction.evict_queue_depth);
    let compress_depth = AdaptiveDepth::new(engine.config_snapshot().compression.compress_queue_depth);
    let mut last_bitmap_rotation = Instant::now();

    while !stop.load(Ordering::Relaxed) && !engine.is_stopped() {
        if last_bitmap_rotation.elapsed() >= ROTATION_PERIOD {
            engine.rotate_stat_bitmap();
            last_bitmap_rotation = Instant::now();
        }

        if engine.config_snapshot().eviction.allow_evict && free_space_target_miss(&engine) {
            let depth = evict_depth.current();
            let mut progressed = 0usize;
            for _ in 0..depth {
                if !engine.eviction_step() {
                    break;
                }
                progressed += 1;
            }
            evict_depth.record_pass(progressed, progressed == depth);
            if progressed > 0 {
                debug!(progressed, depth, "eviction pass made progress");
            }
        }

        if compression_due(&engine) && !engine.has_pending_eviction_or_compression() {
            let depth = compress_depth.current();
            let mut progressed = 0usize;
            for _ in 0..depth {
                if !engine.compression_step() {
                    break;
                }
                progressed += 1;
            }
            compress_depth.record_pass(progressed, progressed == depth);
        }

        thread::sleep(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_depth_doubles_after_idle_following_progress() {
        let depth = AdaptiveDepth::new(4);
        depth.record_pass(3, false); // a pass with progress
        assert_eq!(depth.current(), 4);
        depth.record_pass(0, false); // next pass idle -> double
        assert_eq!(depth.current(), 8);
    }

    #[test]
    fn adaptive_depth_does_not_double_when_still_making_progress() {
        let depth = AdaptiveDepth::new(4);
        depth.record_pass(4, true);
        depth.record_pass(4, true);
        assert_eq!(depth.current(), 4);
    }

    #[test]
    fn adaptive_depth_caps_at_max() {
        let depth = AdaptiveDepth::new(MAX_DEPTH);
        depth.record_pass(1, false);
        depth.record_pass(0, false);
        assert_eq!(depth.current(), MAX_DEPTH);
    }
}
