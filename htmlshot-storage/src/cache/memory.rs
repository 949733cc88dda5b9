//! In-process memory tier.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use htmlshot_core::ContentHash;

use super::CacheEntry;

/// Result of inserting into the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored; `evicted` names the oldest entry dropped to make room.
    Inserted { evicted: Option<ContentHash> },
    /// The hash was already present. Nothing changed.
    AlreadyPresent,
    /// Capacity is zero; the tier is switched off.
    Disabled,
}

struct Slot {
    entry: CacheEntry,
    inserted: Instant,
}

#[derive(Default)]
struct MemoryInner {
    slots: HashMap<ContentHash, Slot>,
    /// Insertion order. Every entry has the same TTL, so expired entries are
    /// always a prefix of this queue.
    order: VecDeque<ContentHash>,
    bytes: u64,
}

impl MemoryInner {
    fn pop_oldest(&mut self) -> Option<ContentHash> {
        let hash = self.order.pop_front()?;
        if let Some(slot) = self.slots.remove(&hash) {
            self.bytes = self.bytes.saturating_sub(slot.entry.len() as u64);
        }
        Some(hash)
    }
}

/// Bounded insertion-ordered map with FIFO eviction and TTL expiry.
pub struct MemoryTier {
    inner: RwLock<MemoryInner>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl MemoryTier {
    /// `ttl` of `None` keeps entries until they are evicted by capacity.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            capacity,
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn is_expired(&self, inserted: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(inserted) >= ttl,
            None => false,
        }
    }

    /// Expired entries read as misses even before the sweep removes them.
    pub fn get(&self, hash: &ContentHash) -> Option<CacheEntry> {
        let inner = self.inner.read().ok()?;
        let slot = inner.slots.get(hash)?;
        if self.is_expired(slot.inserted, Instant::now()) {
            return None;
        }
        Some(slot.entry.clone())
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.get(hash).is_some()
    }

    pub fn insert(&self, hash: ContentHash, entry: CacheEntry) -> InsertOutcome {
        if self.capacity == 0 {
            return InsertOutcome::Disabled;
        }
        let Ok(mut inner) = self.inner.write() else {
            return InsertOutcome::Disabled;
        };
        if inner.slots.contains_key(&hash) {
            return InsertOutcome::AlreadyPresent;
        }

        let evicted = if inner.slots.len() >= self.capacity {
            inner.pop_oldest()
        } else {
            None
        };

        inner.bytes += entry.len() as u64;
        inner.order.push_back(hash);
        inner.slots.insert(
            hash,
            Slot {
                entry,
                inserted: Instant::now(),
            },
        );
        InsertOutcome::Inserted { evicted }
    }

    /// Remove every entry older than the TTL. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };

        let mut removed = 0;
        while let Some(oldest) = inner.order.front().copied() {
            let expired = inner
                .slots
                .get(&oldest)
                .map(|slot| self.is_expired(slot.inserted, now))
                .unwrap_or(true);
            if !expired {
                break;
            }
            inner.pop_oldest();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.inner.read().map(|inner| inner.bytes).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htmlshot_core::ImageFormat;

    fn hash(n: u8) -> ContentHash {
        ContentHash::from_bytes([n; 32])
    }

    fn entry(len: usize) -> CacheEntry {
        CacheEntry::new(vec![7; len], ImageFormat::Png)
    }

    #[test]
    fn test_insert_and_get() {
        let tier = MemoryTier::new(4, None);
        assert_eq!(
            tier.insert(hash(1), entry(10)),
            InsertOutcome::Inserted { evicted: None }
        );
        let got = tier.get(&hash(1)).expect("entry should be present");
        assert_eq!(got.len(), 10);
        assert_eq!(tier.bytes(), 10);
        assert!(tier.get(&hash(2)).is_none());
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let tier = MemoryTier::new(2, None);
        tier.insert(hash(1), entry(1));
        tier.insert(hash(2), entry(2));
        // Reads do not refresh position.
        assert!(tier.get(&hash(1)).is_some());

        let outcome = tier.insert(hash(3), entry(3));
        assert_eq!(
            outcome,
            InsertOutcome::Inserted {
                evicted: Some(hash(1))
            }
        );
        assert_eq!(tier.len(), 2);
        assert!(tier.get(&hash(1)).is_none());
        assert!(tier.get(&hash(2)).is_some());
        assert!(tier.get(&hash(3)).is_some());
        assert_eq!(tier.bytes(), 5);
    }

    #[test]
    fn test_rewrite_is_noop() {
        let tier = MemoryTier::new(2, None);
        tier.insert(hash(1), entry(1));
        assert_eq!(
            tier.insert(hash(1), entry(99)),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(tier.get(&hash(1)).map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_zero_capacity_disables_tier() {
        let tier = MemoryTier::new(0, None);
        assert_eq!(tier.insert(hash(1), entry(1)), InsertOutcome::Disabled);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let ttl = Duration::from_secs(60);
        let tier = MemoryTier::new(8, Some(ttl));
        tier.insert(hash(1), entry(1));
        tier.insert(hash(2), entry(1));

        assert_eq!(tier.sweep(), 0);
        assert_eq!(tier.len(), 2);

        let later = Instant::now() + ttl + Duration::from_millis(1);
        assert_eq!(tier.sweep_at(later), 2);
        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        let tier = MemoryTier::new(8, Some(Duration::ZERO));
        tier.insert(hash(1), entry(1));
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(tier.sweep_at(later), 0);
        assert_eq!(tier.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..8,
            keys in proptest::collection::vec(0u8..16, 0..64),
        ) {
            let tier = MemoryTier::new(capacity, None);
            for key in &keys {
                tier.insert(hash(*key), entry(1));
                proptest::prop_assert!(tier.len() <= capacity);
            }
            // The most recent insert always survives.
            if let Some(last) = keys.last() {
                proptest::prop_assert!(tier.get(&hash(*last)).is_some());
            }
        }
    }
}
