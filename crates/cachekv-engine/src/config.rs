//! Engine configuration
//!
//! One struct per concern, each with a `Default` giving every threshold
//! a concrete value.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cache: CacheSizeConfig,
    pub eviction: EvictionConfig,
    pub compression: CompressionConfig,
    pub memfile: MemFileConfig,
    pub workers: WorkerConfig,
    pub transaction: TransactionConfig,
    pub verify_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheSizeConfig::default(),
            eviction: EvictionConfig::default(),
            compression: CompressionConfig::default(),
            memfile: MemFileConfig::default(),
            workers: WorkerConfig::default(),
            transaction: TransactionConfig::default(),
            verify_cache: false,
        }
    }
}

/// Cache size and free-space thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheSizeConfig {
    /// Below this, throttling is inhibited and eviction will not run.
    pub min_cachesize: u64,
    /// Below this free space, the eviction loop begins running.
    pub min_free_size: u64,
    /// Below this free space, eviction is critical (hard pressure).
    pub critical_free_size: u64,
    /// Below this free space, the throttle loop begins ramping.
    pub throttle_free_size: u64,
    /// Upper bound on cache size.
    pub max_cachesize: u64,
    /// Cache size at which throttling begins ramping (below `max_cachesize`).
    pub max_cachesize_lower: u64,
    /// Window over which cache-size throttling ramps to zero.
    pub max_cachesize_throttle_size: u64,
    /// Below this free metadata space, the metadata rebalancer kicks in.
    pub min_metadata_cache_free: u64,
}

impl Default for CacheSizeConfig {
    fn default() -> Self {
        Self {
            min_cachesize: 1 << 30,                // 1 GiB
            min_free_size: 5 << 30,                 // 5 GiB
            critical_free_size: 1 << 30,             // 1 GiB
            throttle_free_size: 10 << 30,            // 10 GiB
            max_cachesize: 100 << 30,                // 100 GiB
            max_cachesize_lower: 90 << 30,           // 90 GiB
            max_cachesize_throttle_size: 10 << 30,   // 10 GiB
            min_metadata_cache_free: 512 << 20,      // 512 MiB
        }
    }
}

/// Eviction policy knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Master switch for eviction.
    pub allow_evict: bool,
    /// Starting depth walked per eviction pass; auto-doubles under certain conditions.
    pub evict_queue_depth: usize,
    /// Whether to keep reflinked copies in the base transaction.
    pub with_prev_link: bool,
    /// Persist a per-key audit of submissions (`.submitted`).
    pub with_submitted_files: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            allow_evict: true,
            evict_queue_depth: 64,
            with_prev_link: false,
            with_submitted_files: false,
        }
    }
}

/// Background compression policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Target fraction of `cachesize` that should be compressed.
    pub comp_percent: f64,
    /// Minimum cache size before background compression starts.
    pub comp_start_limit: u64,
    /// Starting depth walked per compression pass; auto-doubles like eviction.
    pub compress_queue_depth: usize,
    /// If background compression yields <= this ratio of prior size, redo the upload.
    pub resubmit_compressed_ratio: f64,
    /// Codec id used for background compression.
    pub background_comp_method: CodecId,
    /// Codec id used for "cache file compression" applied to freshly materialized data blocks.
    pub cache_comp: CodecId,
    /// Codec id used for freshly materialized metadata blocks.
    pub meta_cache_comp: CodecId,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            comp_percent: 0.9,
            comp_start_limit: 10 << 30,
            compress_queue_depth: 64,
            resubmit_compressed_ratio: 0.95,
            background_comp_method: CodecId::Zstd3,
            cache_comp: CodecId::Zstd3,
            meta_cache_comp: CodecId::Zstd9,
        }
    }
}

/// Codec identifiers, matching the backend's compression method enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecId {
    Lzma5,
    Zlib5,
    Zstd3,
    Zstd7,
    Zstd9,
    Zstd19,
    None,
}

/// Memfile governance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemFileConfig {
    /// Memfile budget in bytes. `0` disables memfiles entirely.
    pub max_memfile_size: u64,
    /// Backing path for memfiles that must spill (unused by the pure in-memory pool,
    /// kept for parity with the operator-facing option).
    pub memcache_path: Option<PathBuf>,
    /// Force every write through a memfile regardless of the stat bitmap.
    pub only_memfiles: bool,
    /// Scales the fd cache and memfile bitmap sizes.
    pub memory_usage_factor: u64,
}

impl Default for MemFileConfig {
    fn default() -> Self {
        Self {
            max_memfile_size: 256 << 20, // 256 MiB
            memcache_path: None,
            only_memfiles: false,
            memory_usage_factor: 1,
        }
    }
}

/// SubmitWorker pool sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Multiplier applied to `num_cpus` for the general worker pool.
    pub cpu_multiplier: f64,
    /// Multiplier applied to `num_cpus` for the no-compress worker pool.
    pub no_compress_mult: f64,
    /// Maximum batch size for a single `del` submission.
    pub max_del_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cpu_multiplier: 1.0,
            no_compress_mult: 0.5,
            max_del_size: 1000,
        }
    }
}

/// Transaction lifecycle knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Consecutive expected-present read misses before trying `reset(key)`
    /// (only when the operator marker file is present).
    pub reset_retries: u32,
    /// Base delay for capped exponential backoff on backend retries.
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
    /// Cap for exponential backoff.
    #[serde(with = "duration_millis")]
    pub retry_max_delay: Duration,
    /// Absolute attempt cap before giving up permanently.
    pub retry_max_attempts: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            reset_retries: 12,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30 * 60),
            retry_max_attempts: 20,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let cfg = EngineConfig::default();
        assert!(cfg.cache.critical_free_size <= cfg.cache.min_free_size);
        assert!(cfg.cache.max_cachesize_lower <= cfg.cache.max_cachesize);
    }
}
