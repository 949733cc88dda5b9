//! Periodic TTL sweeps for both cache tiers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::TieredCache;

/// Sweep intervals for the two tiers.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often expired memory entries are dropped (default: 60 seconds)
    pub memory_interval: Duration,
    /// How often the disk directory is scanned (default: 1 hour)
    pub disk_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            memory_interval: Duration::from_secs(60),
            disk_interval: Duration::from_secs(3600),
        }
    }
}

/// Spawn one task per tier. Each runs on its own interval until `shutdown_rx`
/// flips to `true`.
pub fn spawn_sweepers(
    cache: Arc<TieredCache>,
    config: SweepConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    tracing::info!(
        memory_interval_secs = config.memory_interval.as_secs(),
        disk_interval_secs = config.disk_interval.as_secs(),
        "Cache sweepers started"
    );

    let memory_cache = Arc::clone(&cache);
    let memory = tokio::spawn(run_sweeper(
        "memory",
        config.memory_interval,
        shutdown_rx.clone(),
        move || {
            let cache = Arc::clone(&memory_cache);
            async move { cache.sweep_memory() }
        },
    ));

    let disk = tokio::spawn(run_sweeper(
        "disk",
        config.disk_interval,
        shutdown_rx,
        move || {
            let cache = Arc::clone(&cache);
            async move { cache.sweep_disk().await }
        },
    ));

    vec![memory, disk]
}

async fn run_sweeper<F, Fut>(
    tier: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = usize>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!(tier, "Cache sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let removed = sweep().await;
                if removed > 0 {
                    tracing::info!(tier, removed, "Swept expired cache entries");
                } else {
                    tracing::trace!(tier, "Cache sweep found nothing to remove");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, DiskCacheError, DiskTier, MemoryTier};
    use htmlshot_core::{ContentHash, ImageFormat};

    #[tokio::test]
    async fn test_sweepers_stop_on_shutdown() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let cache = Arc::new(TieredCache::new(
            MemoryTier::new(4, Some(Duration::from_secs(60))),
            DiskTier::new(dir.path(), None)?,
        ));
        let _ = cache.put(
            ContentHash::from_bytes([1; 32]),
            CacheEntry::new(vec![1], ImageFormat::Png),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_sweepers(
            Arc::clone(&cache),
            SweepConfig {
                memory_interval: Duration::from_millis(10),
                disk_interval: Duration::from_millis(10),
            },
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Nothing is old enough yet.
        assert_eq!(cache.memory().len(), 1);

        shutdown_tx.send(true).expect("receivers alive");
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("sweeper should stop")
                .expect("sweeper should not panic");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sweepers_stop_when_sender_dropped() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let cache = Arc::new(TieredCache::new(
            MemoryTier::new(4, None),
            DiskTier::new(dir.path(), None)?,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_sweepers(
            cache,
            SweepConfig {
                memory_interval: Duration::from_secs(60),
                disk_interval: Duration::from_secs(60),
            },
            shutdown_rx,
        );
        drop(shutdown_tx);

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("sweeper should stop once the sender is gone")
                .expect("sweeper should not panic");
        }
        Ok(())
    }
}
