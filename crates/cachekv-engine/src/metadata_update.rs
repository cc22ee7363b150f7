//! Metadata free-space rebalance loop.
//!
//! Some backing filesystems split their free space into a data pool and a
//! metadata pool that can run out independently of one another even while
//! the other has plenty of room. This loop watches
//! [`cachefs::FreeSpace::free_metadata_bytes`] and, when it drops below
//! `min_metadata_cache_free`, asks the [`cachefs::CacheFs`] to rebalance —
//! metadata first, then a forced allocation if that alone didn't clear the
//! threshold. A rebalance that still leaves metadata space critically low
//! backs off for an hour rather than spinning a rebalance every tick.

use crate::engine::CacheEngine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const OUT_OF_SPACE_BACKOFF: Duration = Duration::from_secs(60 * 60);

pub struct MetadataUpdateLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MetadataUpdateLoop {
    pub fn spawn(engine: Arc<CacheEngine>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("cachekv-metadata-update".into())
            .spawn(move || run(engine, loop_stop))
            .expect("spawn metadata update loop");
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
    let mut backed_off_until: Option<Instant> = None;

    while !stop.load(Ordering::Relaxed) && !engine.is_stopped() {
        if let Some(until) = backed_off_until {
            if Instant::now() < until {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            backed_off_until = None;
        }

        let config = engine.config_snapshot();
        if let Ok(free) = engine.free_space() {
            if free.free_metadata_bytes < config.cache.min_metadata_cache_free {
                debug!(
                    free_metadata_bytes = free.free_metadata_bytes,
                    min = config.cache.min_metadata_cache_free,
                    "metadata space low, rebalancing"
                );
                match engine.rebalance_metadata() {
                    Ok(still_low) if still_low => {
                        warn!("metadata rebalance did not clear pressure, backing off 1h");
                        backed_off_until = Some(Instant::now() + OUT_OF_SPACE_BACKOFF);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "metadata rebalance failed, backing off 1h");
                        backed_off_until = Some(Instant::now() + OUT_OF_SPACE_BACKOFF);
                    }
                }
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}
