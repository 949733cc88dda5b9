//! Content-addressed image cache.
//!
//! Entries are keyed by [`ContentHash`](htmlshot_core::ContentHash) and live
//! in zero, one or both tiers:
//!
//! - [`MemoryTier`]: bounded, insertion-ordered, FIFO eviction at capacity
//! - [`DiskTier`]: one file per entry, `<hex>.<ext>`, unbounded
//!
//! [`TieredCache`] reads memory first, falls back to disk and warms memory on
//! a disk hit. Writes go to memory synchronously and to disk on a spawned
//! task. Both tiers expire entries by TTL through independent periodic sweeps
//! driven by [`spawn_sweepers`].
//!
//! Entries are immutable once written: the same hash always names the same
//! bytes, so writing an existing hash is a no-op.

mod disk;
mod memory;
mod sweeper;
mod tiered;

use std::sync::Arc;

use chrono::Utc;
use htmlshot_core::{ImageFormat, Timestamp};

pub use disk::{DiskCacheError, DiskTier};
pub use memory::{InsertOutcome, MemoryTier};
pub use sweeper::{spawn_sweepers, SweepConfig};
pub use tiered::{CacheTier, TieredCache};

/// A cached rendered image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Shared so that memory hits and response bodies do not copy the image
    /// more than once.
    pub bytes: Arc<Vec<u8>>,
    pub format: ImageFormat,
    pub created_at: Timestamp,
}

impl CacheEntry {
    pub fn new(bytes: Vec<u8>, format: ImageFormat) -> Self {
        Self {
            bytes: Arc::new(bytes),
            format,
            created_at: Utc::now(),
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered by either tier.
    pub hits: u64,
    /// Lookups answered by neither tier.
    pub misses: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    /// Entries currently held in memory.
    pub entry_count: u64,
    /// Bytes currently held in memory.
    pub memory_bytes: u64,
    /// Memory entries removed to make room (FIFO).
    pub evictions: u64,
    /// Entries removed by TTL sweeps, both tiers.
    pub expired: u64,
    pub disk_write_failures: u64,
}

impl CacheStats {
    /// Calculate the hit rate (hits / total requests).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
