//! Read-rate throttle loop
//!
//! A token bucket, scaled every second from the cache's current free-space
//! and cache-size pressure (fixed-point tokens scaled by 1000 for
//! sub-token precision, refilled on a timer rather than per-call).

use crate::engine::CacheEngine;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const SCALE: u64 = 1000;

/// Fixed-point token bucket; `rate_per_sec` and capacity are scaled by
/// [`SCALE`] internally so fractional rates (e.g. 0.5 gets/sec while
/// ramping down near `max_cachesize`) don't round to zero.
struct TokenBucket {
    tokens: AtomicU64,
    rate_per_sec: AtomicU64,
    max_tokens: AtomicU64,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    fn new(rate_per_sec: u64) -> Self {
        Self {
            tokens: AtomicU64::new(rate_per_sec * SCALE),
            rate_per_sec: AtomicU64::new(rate_per_sec),
            max_tokens: AtomicU64::new(rate_per_sec * SCALE),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    fn set_rate(&self, rate_per_sec: u64) {
        self.rate_per_sec.store(rate_per_sec, Ordering::Relaxed);
        self.max_tokens.store(rate_per_sec.max(1) * SCALE, Ordering::Relaxed);
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock().unwrap();
        let elapsed = last.elapsed();
        if elapsed < Duration::from_millis(50) {
            return;
        }
        *last = Instant::now();
        let rate = self.rate_per_sec.load(Ordering::Relaxed);
        let added = (rate as u128 * elapsed.as_millis() * SCALE as u128 / 1000) as u64;
        let max = self.max_tokens.load(Ordering::Relaxed);
        let mut cur = self.tokens.load(Ordering::Relaxed);
        loop {
            let new = cur.saturating_add(added).min(max);
            match self
                .tokens
                .compare_exchange_weak(cur, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Unthrottled when `rate_per_sec` is `0` (disabled).
    fn try_acquire(&self) -> bool {
        if self.rate_per_sec.load(Ordering::Relaxed) == 0 {
            return true;
        }
        self.refill();
        let mut cur = self.tokens.load(Ordering::Relaxed);
        loop {
            if cur < SCALE {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                cur,
                cur - SCALE,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Gates `get()` calls under free-space/cache-size pressure. `0` from
/// [`Throttle::remaining_gets`] means unthrottled (the common case).
pub struct Throttle {
    bucket: TokenBucket,
}

impl Throttle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bucket: TokenBucket::new(0),
        })
    }

    /// Whether a caller not marked `disable_throttling` may proceed now.
    pub fn admit(&self) -> bool {
        self.bucket.try_acquire()
    }

    fn recompute(&self, engine: &CacheEngine) {
        let config = engine.config_snapshot();
        let free = engine.free_space().ok();
        let (_comp_bytes, cachesize) = engine.comp_bytes_and_cachesize();

        let rate = match free {
            Some(fs) if fs.free_bytes <= config.cache.critical_free_size => 0,
            Some(fs) if fs.free_bytes < config.cache.throttle_free_size => {
                // Ramp linearly from 0 at critical_free_size to "unthrottled"
                // (a generous flat cap) at throttle_free_size.
                let span = config
                    .cache
                    .throttle_free_size
                    .saturating_sub(config.cache.critical_free_size)
                    .max(1);
                let progress = fs.free_bytes.saturating_sub(config.cache.critical_free_size);
                (progress * 10_000 / span).max(1)
            }
            _ if cachesize > config.cache.max_cachesize_lower => {
                let span = config
                    .cache
                    .max_cachesize
                    .saturating_sub(config.cache.max_cachesize_lower)
                    .max(1);
                let over = cachesize.saturating_sub(config.cache.max_cachesize_lower);
                let remaining = span.saturating_sub(over.min(span));
                (remaining * 10_000 / span).max(1)
            }
            _ => 0, // unthrottled
        };
        self.bucket.set_rate(rate);
        debug!(rate, "throttle rate recomputed");
    }
}

/// Background driver: recomputes the throttle rate once a second.
pub struct ThrottleLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ThrottleLoop {
    pub fn spawn(engine: Arc<CacheEngine>, throttle: Arc<Throttle>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("cachekv-throttle".into())
            .spawn(move || {
                while !loop_stop.load(Ordering::Relaxed) && !engine.is_stopped() {
                    throttle.recompute(&engine);
                    thread::sleep(Duration::from_secs(1));
                }
            })
            .expect("spawn throttle loop");
        Self { stop, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            h.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unthrottled_bucket_always_admits() {
        let bucket = TokenBucket::new(0);
        for _ in 0..100 {
            assert!(bucket.try_acquire());
        }
    }

    #[test]
    fn rate_limited_bucket_exhausts_then_blocks() {
        let bucket = TokenBucket::new(2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }
}
