//! `SubmitWorker` pool — drains the submission queue against the backend
//!
//! A small pool of OS threads, each repeatedly claiming the next queued
//! item and running it to completion (including retries) before claiming
//! another. Workers never share an in-flight item —
//! `SubmissionQueue::claim_next` guarantees that.

use crate::backend::HasKeyCallback;
use crate::engine::CacheEngine;
use crate::key::{Key, TransId};
use crate::submission::SubmissionKind;
use crate::transaction::{self, DirtyRecord};

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// A running pool of submit-worker threads.
///
/// Sized by `WorkerConfig::cpu_multiplier` against the number of available
/// cores, following the teacher's `num_cpus`-scaled pool sizing.
pub struct SubmitWorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SubmitWorkerPool {
    pub fn spawn(engine: Arc<CacheEngine>, worker_count: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(worker_count.max(1));
        for idx in 0..worker_count.max(1) {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            handles.push(
                thread::Builder::new()
                    .name(format!("cachekv-submit-{idx}"))
                    .spawn(move || run_worker(engine, stop))
                    .expect("spawn submit worker"),
            );
        }
        Self { stop, handles }
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles {
            handle.join().ok();
        }
    }
}

fn run_worker(engine: Arc<CacheEngine>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) && !engine.is_stopped() {
        let claimed = engine.submission.lock().claim_next();
        let Some((transid, key, kind)) = claimed else {
            thread::sleep(Duration::from_millis(200));
            continue;
        };
        if let Err(e) = process_item(&engine, transid, &key, &kind) {
            warn!(key = %key, error = %e, "submission permanently failed, requeueing for retry");
            engine.submission.lock().requeue(transid, &key);
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn process_item(
    engine: &Arc<CacheEngine>,
    transid: TransId,
    key: &Key,
    kind: &SubmissionKind,
) -> crate::error::CacheResult<()> {
    match kind {
        SubmissionKind::Dirty { .. } => upload_dirty(engine, transid, key),
        SubmissionKind::Evict => confirm_and_evict(engine, transid, key),
        SubmissionKind::Delete => flush_deletes(engine, transid, key),
        SubmissionKind::Compress => compress_item(engine, transid, key),
    }
}

fn upload_dirty(engine: &Arc<CacheEngine>, transid: TransId, key: &Key) -> crate::error::CacheResult<()> {
    let (mut reader, _len) = engine.read_source(transid, key)?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    let uploaded = with_retry(engine, || {
        let mut cursor = std::io::Cursor::new(data.clone());
        engine.backend.put(key, transid, &mut cursor, false, false)
    })?;
    engine.item_submitted(transid, key, &SubmissionKind::Dirty { memfile_backed: false }, uploaded);
    Ok(())
}

fn confirm_and_evict(engine: &Arc<CacheEngine>, transid: TransId, key: &Key) -> crate::error::CacheResult<()> {
    let (present, _md5) = engine.backend.has_backend_key(key, false);
    if !present {
        // The eviction candidate never actually made it to the backend;
        // fall back to treating it as a fresh dirty upload instead.
        return upload_dirty(engine, transid, key);
    }
    engine.item_submitted(transid, key, &SubmissionKind::Evict, 0);
    Ok(())
}

fn compress_item(engine: &Arc<CacheEngine>, transid: TransId, key: &Key) -> crate::error::CacheResult<()> {
    let (mut reader, prior_size) = engine.read_source(transid, key)?;
    let mut cleartext = Vec::new();
    reader.read_to_end(&mut cleartext)?;
    let config = engine.config_snapshot().compression;
    let compressed = engine.codec.compress(&cleartext, config.background_comp_method)?;
    let framed_len = engine.write_comp_sibling(transid, key, &compressed)?;

    // Only worth resubmitting to the backend if compression actually
    // shrank the block by a meaningful margin; otherwise the backend
    // already holds an acceptable copy and a re-upload would just be
    // wasted bandwidth.
    if prior_size > 0 && (framed_len as f64) <= config.resubmit_compressed_ratio * prior_size as f64 {
        with_retry(engine, || {
            let mut cursor = std::io::Cursor::new(compressed.clone());
            engine.backend.put(key, transid, &mut cursor, true, false)
        })?;
    }

    engine.item_compressed(transid, key, framed_len);
    Ok(())
}

fn flush_deletes(engine: &Arc<CacheEngine>, transid: TransId, batch_key: &Key) -> crate::error::CacheResult<()> {
    let deleted_path = transaction::trans_dir(transid).join(transaction::DELETED_FILE);
    let mut buf = Vec::new();
    engine.fs.open_read(&deleted_path)?.read_to_end(&mut buf)?;
    let records: Vec<DirtyRecord> = transaction::decode_dirty_list(&buf)?;
    let keys: Vec<Key> = records.into_iter().map(|r| r.key).collect();
    if keys.is_empty() {
        return Ok(());
    }
    struct StillReferenced<'a>(&'a CacheEngine);
    impl HasKeyCallback for StillReferenced<'_> {
        fn has_key(&self, key: &Key) -> bool {
            self.0.has_item_cached(key)
        }
    }
    with_retry(engine, || engine.backend.del(&keys, transid))?;
    let needs_flush = engine.backend.submit_del(&StillReferenced(engine), transid)?;
    if needs_flush {
        engine.backend.sync()?;
        engine.backend.submit_del_post_flush();
    }
    engine.delete_submitted(transid, batch_key, keys.len() as u64);
    Ok(())
}

/// Retry `f` using the flat-1s-then-exponential policy resolved for
/// `fast_write_retry()`, capped at
/// `TransactionConfig::retry_max_attempts`.
fn with_retry<T>(
    engine: &Arc<CacheEngine>,
    mut f: impl FnMut() -> crate::error::CacheResult<T>,
) -> crate::error::CacheResult<T> {
    let config = engine.config_snapshot().transaction;
    let fast = engine.backend.fast_write_retry();
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < config.retry_max_attempts => {
                let delay = if fast && attempt == 0 {
                    Duration::from_secs(1)
                } else {
                    let exp = config.retry_base_delay.saturating_mul(1u32 << attempt.min(20));
                    exp.min(config.retry_max_delay)
                };
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying submission");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                error!(attempts = attempt, error = %e, "submission exhausted retries");
                return Err(e);
            }
        }
    }
}
