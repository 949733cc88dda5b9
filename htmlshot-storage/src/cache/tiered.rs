//! Memory-then-disk lookup with write-through persistence.

use std::sync::{Arc, RwLock};

use htmlshot_core::{ContentHash, ImageFormat};
use tokio::task::JoinHandle;

use super::{CacheEntry, CacheStats, DiskTier, InsertOutcome, MemoryTier};

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Memory,
    Disk,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Disk => "disk",
        }
    }
}

/// Memory + disk image cache.
///
/// Lookups and memory writes are synchronous and never fail: disk errors are
/// logged and treated as misses so a broken disk can only cost a re-render.
pub struct TieredCache {
    memory: MemoryTier,
    disk: Arc<DiskTier>,
    stats: Arc<RwLock<CacheStats>>,
}

impl TieredCache {
    pub fn new(memory: MemoryTier, disk: DiskTier) -> Self {
        Self {
            memory,
            disk: Arc::new(disk),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// Look up `hash`, warming memory on a disk hit.
    pub async fn get(
        &self,
        hash: &ContentHash,
        format: Option<ImageFormat>,
    ) -> Option<(CacheEntry, CacheTier)> {
        if let Some(entry) = self.memory.get(hash) {
            self.record(|s| {
                s.hits += 1;
                s.memory_hits += 1;
            });
            return Some((entry, CacheTier::Memory));
        }

        match self.disk.get(hash, format).await {
            Ok(Some(entry)) => {
                self.insert_memory(*hash, entry.clone());
                self.record(|s| {
                    s.hits += 1;
                    s.disk_hits += 1;
                });
                tracing::debug!(hash = %hash, "Warmed memory tier from disk");
                Some((entry, CacheTier::Disk))
            }
            Ok(None) => {
                self.record(|s| s.misses += 1);
                None
            }
            Err(e) => {
                tracing::warn!(hash = %hash, error = %e, "Disk cache read failed");
                self.record(|s| s.misses += 1);
                None
            }
        }
    }

    /// Store an entry in memory now and on disk in the background.
    ///
    /// The returned handle completes once the disk write has finished or
    /// failed; callers on the request path drop it.
    pub fn put(&self, hash: ContentHash, entry: CacheEntry) -> JoinHandle<()> {
        self.insert_memory(hash, entry.clone());

        let disk = Arc::clone(&self.disk);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            match disk.put(&hash, &entry).await {
                Ok(true) => tracing::debug!(hash = %hash, bytes = entry.len(), "Persisted image to disk"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(hash = %hash, error = %e, "Disk cache write failed");
                    if let Ok(mut s) = stats.write() {
                        s.disk_write_failures += 1;
                    }
                }
            }
        })
    }

    fn insert_memory(&self, hash: ContentHash, entry: CacheEntry) {
        if let InsertOutcome::Inserted {
            evicted: Some(evicted),
        } = self.memory.insert(hash, entry)
        {
            tracing::trace!(hash = %evicted, "Evicted oldest memory entry");
            self.record(|s| s.evictions += 1);
        }
    }

    pub fn sweep_memory(&self) -> usize {
        let removed = self.memory.sweep();
        if removed > 0 {
            self.record(|s| s.expired += removed as u64);
        }
        removed
    }

    pub async fn sweep_disk(&self) -> usize {
        match self.disk.sweep().await {
            Ok(removed) => {
                if removed > 0 {
                    self.record(|s| s.expired += removed as u64);
                }
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Disk cache sweep failed");
                0
            }
        }
    }

    /// Current statistics, with live memory occupancy.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.entry_count = self.memory.len() as u64;
        stats.memory_bytes = self.memory.bytes();
        stats
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }
}
