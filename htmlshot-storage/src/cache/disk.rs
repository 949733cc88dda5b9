//! On-disk tier: one file per entry under a flat directory.
//!
//! Filenames are `<hex hash>.<extension>`. Writes go to a unique `*.tmp`
//! file first and are renamed into place, so readers never see a partially
//! written image. Expiry is by file modification time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use htmlshot_core::{ContentHash, ImageFormat, StorageError};

use super::CacheEntry;

const TMP_EXTENSION: &str = "tmp";

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Error type for disk tier operations.
#[derive(Debug, thiserror::Error)]
pub enum DiskCacheError {
    /// Failed to create the cache directory.
    #[error("Failed to prepare cache directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DiskCacheError> for StorageError {
    fn from(e: DiskCacheError) -> Self {
        StorageError::Io {
            reason: e.to_string(),
        }
    }
}

/// File-per-entry image store.
#[derive(Debug, Clone)]
pub struct DiskTier {
    dir: PathBuf,
    ttl: Option<Duration>,
}

impl DiskTier {
    /// Open (creating if needed) the cache directory. A `ttl` of `None` or
    /// zero keeps files forever.
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Result<Self, DiskCacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| DiskCacheError::Directory {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn path_for(&self, hash: &ContentHash, format: ImageFormat) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hash.to_hex(), format.extension()))
    }

    fn is_expired(&self, modified: SystemTime, now: SystemTime) -> bool {
        match self.ttl {
            Some(ttl) => is_older_than(modified, now, ttl),
            None => false,
        }
    }

    /// Look up `hash`. Without a known format every supported extension is
    /// probed in turn.
    pub async fn get(
        &self,
        hash: &ContentHash,
        format: Option<ImageFormat>,
    ) -> Result<Option<CacheEntry>, DiskCacheError> {
        let candidates: &[ImageFormat] = match &format {
            Some(format) => std::slice::from_ref(format),
            None => &ImageFormat::ALL,
        };

        for &candidate in candidates {
            let path = self.path_for(hash, candidate);
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let modified = metadata.modified()?;
            if self.is_expired(modified, SystemTime::now()) {
                continue;
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Swept between metadata and read.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            return Ok(Some(CacheEntry {
                bytes: Arc::new(bytes),
                format: candidate,
                created_at: DateTime::<Utc>::from(modified),
            }));
        }
        Ok(None)
    }

    /// Persist an entry. Returns `false` when a file for this hash and format
    /// already exists.
    pub async fn put(&self, hash: &ContentHash, entry: &CacheEntry) -> Result<bool, DiskCacheError> {
        let path = self.path_for(hash, entry.format);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }

        let sequence = TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(
            "{}.{}.{}-{}.{}",
            hash.to_hex(),
            entry.format.extension(),
            std::process::id(),
            sequence,
            TMP_EXTENSION
        ));

        if let Err(e) = tokio::fs::write(&tmp, entry.bytes.as_slice()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(true)
    }

    /// Delete every cache file older than the TTL, including abandoned
    /// temporary files. Returns the number of files removed.
    pub async fn sweep(&self) -> Result<usize, DiskCacheError> {
        self.sweep_at(SystemTime::now()).await
    }

    pub async fn sweep_at(&self, now: SystemTime) -> Result<usize, DiskCacheError> {
        let Some(ttl) = self.ttl else {
            return Ok(0);
        };

        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if !is_cache_file(&path) {
                continue;
            }
            let Ok(metadata) = item.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if !is_older_than(modified, now, ttl) {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove expired cache file");
                }
            }
        }
        Ok(removed)
    }
}

fn is_older_than(modified: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    now.duration_since(modified)
        .map(|age| age >= ttl)
        .unwrap_or(false)
}

fn is_cache_file(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(TMP_EXTENSION) => true,
        Some(ext) => ImageFormat::from_extension(ext).is_some(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ContentHash {
        ContentHash::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_put_then_get_with_known_format() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let tier = DiskTier::new(dir.path(), None)?;
        let entry = CacheEntry::new(b"jpeg-bytes".to_vec(), ImageFormat::Jpeg);

        assert!(tier.put(&hash(1), &entry).await?);
        assert!(dir
            .path()
            .join(format!("{}.jpg", hash(1).to_hex()))
            .exists());

        let got = tier
            .get(&hash(1), Some(ImageFormat::Jpeg))
            .await?
            .expect("entry should be on disk");
        assert_eq!(got.bytes.as_slice(), b"jpeg-bytes");
        assert_eq!(got.format, ImageFormat::Jpeg);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_probes_all_extensions() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let tier = DiskTier::new(dir.path(), None)?;
        tier.put(&hash(2), &CacheEntry::new(vec![1], ImageFormat::Webp))
            .await?;

        let got = tier.get(&hash(2), None).await?.expect("probe should find webp");
        assert_eq!(got.format, ImageFormat::Webp);
        assert!(tier.get(&hash(2), Some(ImageFormat::Png)).await?.is_none());
        assert!(tier.get(&hash(3), None).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_put_is_noop() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let tier = DiskTier::new(dir.path(), None)?;
        assert!(tier.put(&hash(1), &CacheEntry::new(vec![1], ImageFormat::Png)).await?);
        assert!(!tier.put(&hash(1), &CacheEntry::new(vec![2], ImageFormat::Png)).await?);

        let got = tier.get(&hash(1), None).await?.expect("entry");
        assert_eq!(got.bytes.as_slice(), &[1]);
        // No temporary files left behind.
        let leftovers = std::fs::read_dir(dir.path())?
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_respects_ttl() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let ttl = Duration::from_secs(60);
        let tier = DiskTier::new(dir.path(), Some(ttl))?;
        tier.put(&hash(1), &CacheEntry::new(vec![1], ImageFormat::Png))
            .await?;
        std::fs::write(dir.path().join("notes.txt"), b"keep me")?;

        assert_eq!(tier.sweep().await?, 0);
        let later = SystemTime::now() + ttl + Duration::from_secs(1);
        assert_eq!(tier.sweep_at(later).await?, 1);
        assert!(tier.get(&hash(1), None).await?.is_none());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_ttl_never_sweeps() -> Result<(), DiskCacheError> {
        let dir = tempfile::tempdir()?;
        let tier = DiskTier::new(dir.path(), Some(Duration::ZERO))?;
        tier.put(&hash(1), &CacheEntry::new(vec![1], ImageFormat::Png))
            .await?;
        let later = SystemTime::now() + Duration::from_secs(86_400 * 365);
        assert_eq!(tier.sweep_at(later).await?, 0);
        assert!(tier.get(&hash(1), None).await?.is_some());
        Ok(())
    }
}
