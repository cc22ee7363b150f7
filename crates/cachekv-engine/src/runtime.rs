//! Wires a [`CacheEngine`] together with its background loops into one
//! owned handle.
//!
//! Construction order matters: the engine itself must exist before any
//! loop that borrows an `Arc<CacheEngine>` can spawn, and `stop` order is
//! the reverse — loops first (so nothing is still submitting/evicting),
//! then the engine's own `stop` flag.

use crate::backend::BlockStore;
use crate::cachefs::CacheFs;
use crate::codec::Codec;
use crate::config::EngineConfig;
use crate::engine::CacheEngine;
use crate::error::CacheResult;
use crate::eviction::EvictionLoop;
use crate::metadata_update::MetadataUpdateLoop;
use crate::throttle::ThrottleLoop;
use crate::worker::SubmitWorkerPool;

use std::sync::Arc;

fn worker_count(config: &EngineConfig) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    ((cores as f64 * config.workers.cpu_multiplier).ceil() as usize).max(1)
}

/// An owned, running [`CacheEngine`] plus its submit-worker pool and
/// background loops. Dropping this without calling [`EngineRuntime::stop`]
/// leaks the background threads (they are daemon-style and will simply
/// run until the process exits) — prefer calling `stop` explicitly.
pub struct EngineRuntime {
    pub engine: Arc<CacheEngine>,
    workers: Option<SubmitWorkerPool>,
    throttle_loop: Option<ThrottleLoop>,
    eviction_loop: Option<EvictionLoop>,
    metadata_loop: Option<MetadataUpdateLoop>,
}

impl EngineRuntime {
    /// Build a fresh engine against the given backend/filesystem/codec and
    /// start its worker pool and background loops.
    pub fn start(
        backend: Arc<dyn BlockStore>,
        fs: Arc<dyn CacheFs>,
        codec: Arc<dyn Codec>,
        config: EngineConfig,
    ) -> CacheResult<Self> {
        let workers = worker_count(&config);
        let engine = CacheEngine::new(backend, fs, codec, config)?;

        let worker_pool = SubmitWorkerPool::spawn(Arc::clone(&engine), workers);
        let throttle = Arc::clone(engine.throttle());
        let throttle_loop = ThrottleLoop::spawn(Arc::clone(&engine), throttle);
        let eviction_loop = EvictionLoop::spawn(Arc::clone(&engine));
        let metadata_loop = MetadataUpdateLoop::spawn(Arc::clone(&engine));

        Ok(Self {
            engine,
            workers: Some(worker_pool),
            throttle_loop: Some(throttle_loop),
            eviction_loop: Some(eviction_loop),
            metadata_loop: Some(metadata_loop),
        })
    }

    /// Stop all background loops, then the engine's own submission
    /// acceptance, in reverse startup order.
    pub fn stop(mut self) {
        if let Some(l) = self.metadata_loop.take() {
            l.stop();
        }
        if let Some(l) = self.eviction_loop.take() {
            l.stop();
        }
        if let Some(l) = self.throttle_loop.take() {
            l.stop();
        }
        self.engine.stop();
        if let Some(w) = self.workers.take() {
            w.stop();
        }
    }
}
