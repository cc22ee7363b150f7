//! Per-call option flags for `get`/`put`-style operations

/// Options controlling a single `get` (and `release`) call.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    /// Bypass the fd cache; open and close the backing file for this call only.
    pub disable_fd_cache: bool,
    /// Exempt this retrieval from the throttle loop's pacing.
    pub disable_throttling: bool,
    /// Move this item to the front of the eviction queue with priority over writes.
    pub prioritize_read: bool,
    /// Hint that access is random rather than sequential; affects readahead decisions.
    pub read_random: bool,
    /// Reject writes against the returned handle; a local miss still falls
    /// through to the backend, but a persistent miss records a
    /// `missing_<hexkey>` sentinel instead of retrying indefinitely.
    pub read_only: bool,
    /// Evict the item again right after this single read completes.
    pub preload_once: bool,
    /// Never route this read through a memfile, even if one would normally apply.
    pub disable_memfiles: bool,
}

impl GetFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_preload_once(mut self) -> Self {
        self.preload_once = true;
        self
    }
}

/// Options controlling a single `put` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutFlags {
    /// The payload is already compressed and/or encrypted; store verbatim,
    /// skip the codec's compress step, and submit as-is.
    pub already_compressed_encrypted: bool,
    /// This is a metadata block rather than a data block (affects which
    /// codec and cache-comp settings apply).
    pub metadata: bool,
}

impl PutFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_set_expected_fields() {
        let f = GetFlags::new().with_read_only().with_preload_once();
        assert!(f.read_only);
        assert!(f.preload_once);
        assert!(!f.disable_fd_cache);
    }
}
