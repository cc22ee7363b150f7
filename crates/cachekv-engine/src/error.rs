//! Cache engine error types

use thiserror::Error;

/// Errors surfaced by the cache engine.
///
/// Retryable failures (backend-retryable, cache-retryable) are handled
/// internally with backoff and never reach the caller; this enum covers
/// the failures that are allowed to escape `CacheEngine`'s public API.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The key is not present locally or at the backend.
    #[error("key not found: {0}")]
    NotFound(String),

    /// I/O error reading or writing a cache file.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused `new_transaction`, `transaction_finalize`, or
    /// `set_active_transactions` permanently.
    #[error("backend transaction error: {0}")]
    BackendFatal(String),

    /// Cache filesystem could not be prepared (lock file, subvolume, `dirty` write).
    #[error("cache filesystem error: {0}")]
    CacheFatal(String),

    /// MD5/checksum mismatch on a decompressed block or a `dirty` record.
    #[error("integrity check failed for {0}")]
    Integrity(String),

    /// Free space fell below a hard threshold and eviction is disabled.
    #[error("cache exhausted: {0}")]
    ResourceExhausted(String),

    /// Missing or invalid engine configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A debug-mode invariant check failed.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The engine is shutting down.
    #[error("engine stopped")]
    Stopped,
}

/// Result type for cache engine operations.
pub type CacheResult<T> = Result<T, CacheError>;
