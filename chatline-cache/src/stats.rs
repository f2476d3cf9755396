//! Cache usage counters.

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a fresh entry.
    pub hits: u64,
    /// Reads served from a stale entry while revalidating.
    pub stale_hits: u64,
    /// Reads that had to wait for a fetch.
    pub misses: u64,
    /// Callers that joined a fetch already in flight.
    pub coalesced: u64,
    /// Background revalidations started from stale reads.
    pub background_refreshes: u64,
    /// Entries removed to stay within capacity.
    pub evictions: u64,
    /// Fetches that settled with an error.
    pub fetch_failures: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Fraction of reads answered without waiting (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
