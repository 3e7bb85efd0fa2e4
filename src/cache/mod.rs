//! Cache Module
//!
//! Provides the bounded LRU mirror of recently touched records, held in a
//! memory segment shared by every process. The cache is never authoritative;
//! the storage log is.

mod segment;
mod shared;
mod stats;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use segment::{segment_size, Segment};
pub use shared::SharedCache;
pub use stats::CacheStats;

// == Public Constants ==
/// Default number of entries in the shared cache
pub const DEFAULT_CAPACITY: usize = 1000;
