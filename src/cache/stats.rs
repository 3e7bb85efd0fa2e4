//! Cache Statistics Module
//!
//! Snapshot of the counters kept in the shared segment header. The counters
//! are shared by every process attached to the segment.

use serde::Serialize;

// == Cache Stats ==
/// Cache performance metrics across all processes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals
    pub misses: u64,
    /// Number of entries evicted due to LRU policy
    pub evictions: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

impl CacheStats {
    // == Constructor ==
    pub fn new(
        hits: u64,
        misses: u64,
        evictions: u64,
        total_entries: usize,
        capacity: usize,
    ) -> Self {
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            hits as f64 / total_requests as f64
        } else {
            0.0
        };
        Self {
            hits,
            misses,
            evictions,
            total_entries,
            capacity,
            hit_rate,
        }
    }
}
