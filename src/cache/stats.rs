//! Cache Statistics Module
//!
//! Tracks per-store counters for reads, lazy evictions and writes.

use serde::Serialize;

// == Cache Stats ==
/// Counters of one store since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads that returned a verified entry
    pub hits: u64,
    /// Reads that found nothing or an invalid entry
    pub misses: u64,
    /// Entries removed lazily because verification failed
    pub evictions: u64,
    /// Successful writes
    pub writes: u64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_write(&mut self) {
        self.writes += 1;
    }

    /// Adds another store's counters, used to aggregate shards.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.writes += other.writes;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats, CacheStats::default());
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_merge() {
        let mut total = CacheStats::new();
        let mut shard = CacheStats::new();
        shard.record_write();
        shard.record_eviction();
        shard.record_miss();
        total.merge(&shard);
        total.merge(&shard);
        assert_eq!(total.writes, 2);
        assert_eq!(total.evictions, 2);
        assert_eq!(total.misses, 2);
        assert_eq!(total.hits, 0);
    }
}
