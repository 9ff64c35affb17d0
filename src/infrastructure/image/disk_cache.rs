//! Disk-based image cache for persistence across sessions.
//!
//! Layout: one `<cache key>.img` file per entry holding the raw downloaded
//! bytes, no header. Writes go through a temporary file in the same
//! directory and are renamed into place, so a reader sees either the old
//! content, the new content, or nothing.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::domain::entities::{CACHE_FILE_EXTENSION, CacheKey};
use crate::domain::errors::{CacheError, CacheResult};

/// Maximum disk cache size in bytes (200 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 200 * 1024 * 1024;

const TEMP_PREFIX: &str = ".tmp";

/// Disk-based image cache that persists raw image bytes.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    max_size: u64,
    current_size: AtomicU64,
    item_count: AtomicUsize,
    /// Serializes writes, evictions and clears so the counters match the
    /// directory.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl DiskImageCache {
    /// Creates a new disk cache in the specified directory.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn new(cache_dir: PathBuf, max_size: u64) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::io(format!("Failed to create cache dir: {e}")))?;
        let mut total_size = 0u64;
        let mut count = 0usize;

        let mut entries = fs::read_dir(&cache_dir)
            .await
            .map_err(|e| CacheError::io(format!("Failed to read cache dir: {e}")))?;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_cache_file(&path)
                && let Ok(meta) = entry.metadata().await
            {
                total_size += meta.len();
                count += 1;
            }
        }

        let cache = Self {
            cache_dir,
            max_size,
            current_size: AtomicU64::new(total_size),
            item_count: AtomicUsize::new(count),
            write_lock: Mutex::new(()),
        };

        cache.cleanup_if_needed().await;

        Ok(cache)
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the file path for a cache key. The file may not exist.
    #[must_use]
    pub fn location(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.filename())
    }

    /// Gets raw image bytes from disk cache.
    pub async fn get_bytes(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.location(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                Some(bytes)
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to read disk cache entry");
                }
                trace!(key = %key, "Disk cache miss");
                None
            }
        }
    }

    /// Stores raw bytes in the disk cache, replacing any existing entry.
    ///
    /// # Errors
    /// Returns error if the file cannot be written or moved into place.
    pub async fn put_bytes(&self, key: &CacheKey, bytes: &[u8]) -> CacheResult<()> {
        self.store(key, bytes, true).await.map(|_| ())
    }

    /// Stores raw bytes, optionally refusing to replace an existing entry.
    ///
    /// Returns `Ok(false)` when `overwrite` is false and an entry exists.
    ///
    /// # Errors
    /// Returns error if the file cannot be written or moved into place.
    pub async fn store(&self, key: &CacheKey, bytes: &[u8], overwrite: bool) -> CacheResult<bool> {
        let path = self.location(key);
        let _guard = self.write_lock.lock().await;
        let old_size = fs::metadata(&path).await.map(|m| m.len()).ok();

        if !overwrite && old_size.is_some() {
            trace!(key = %key, "Disk cache entry exists, not overwriting");
            return Ok(false);
        }

        let written = write_atomic(&self.cache_dir, &path, bytes.to_vec(), overwrite).await?;
        if !written {
            return Ok(false);
        }

        let new_size = bytes.len() as u64;
        if let Some(old) = old_size {
            if new_size > old {
                self.current_size
                    .fetch_add(new_size - old, Ordering::Relaxed);
            } else {
                self.current_size
                    .fetch_sub(old - new_size, Ordering::Relaxed);
            }
        } else {
            self.current_size.fetch_add(new_size, Ordering::Relaxed);
            self.item_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");

        self.cleanup_if_needed().await;

        Ok(true)
    }

    /// Removes an entry from disk cache.
    pub async fn evict(&self, key: &CacheKey) {
        let path = self.location(key);
        let _guard = self.write_lock.lock().await;
        let size = fs::metadata(&path).await.map(|m| m.len()).ok();
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key = %key, error = %e, "Failed to evict from disk cache");
            }
        } else if let Some(s) = size {
            self.current_size.fetch_sub(s, Ordering::Relaxed);
            self.item_count.fetch_sub(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted from disk cache");
        }
    }

    /// Clears the entire disk cache, including abandoned temporary files.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be read.
    pub async fn clear(&self) -> CacheResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| CacheError::io(format!("Failed to read cache dir: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            if (is_cache_file(&path) || is_temp_file(&path))
                && fs::remove_file(&path).await.is_err()
            {
                warn!(path = %path.display(), "Failed to remove cache file");
            }
        }
        self.current_size.store(0, Ordering::Relaxed);
        self.item_count.store(0, Ordering::Relaxed);
        debug!("Cleared disk cache");
        Ok(())
    }

    /// Returns the current cache size in bytes.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Returns the number of cached files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if an entry is cached.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.location(key)).await.unwrap_or(false)
    }

    /// Removes least recently accessed entries once over the size limit.
    /// Callers other than `new` hold the write lock.
    async fn cleanup_if_needed(&self) {
        let current_size = self.current_size();
        if current_size <= self.max_size {
            return;
        }

        debug!(
            current_size = current_size,
            max_size = self.max_size,
            "Disk cache over limit, cleaning up"
        );

        let Ok(mut entries) = fs::read_dir(&self.cache_dir).await else {
            return;
        };

        let mut files: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_cache_file(&path) {
                continue;
            }

            if let Ok(meta) = entry.metadata().await {
                let accessed = meta
                    .accessed()
                    .or_else(|_| meta.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                files.push((path, accessed, meta.len()));
            }
        }

        files.sort_by_key(|(_, time, _)| *time);

        let mut freed_size = 0u64;
        let mut freed_count = 0usize;
        let target = current_size - self.max_size + (self.max_size / 10);

        for (path, _, size) in files {
            if freed_size >= target {
                break;
            }

            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove old cache file");
            } else {
                debug!(path = %path.display(), "Removed old cache file");
                freed_size += size;
                freed_count += 1;
            }
        }
        self.current_size.fetch_sub(freed_size, Ordering::Relaxed);
        self.item_count.fetch_sub(freed_count, Ordering::Relaxed);

        debug!(
            freed_size = freed_size,
            freed_count = freed_count,
            "Disk cache cleanup complete"
        );
    }
}

/// Writes `bytes` to a temp file next to `path` and renames it into place.
async fn write_atomic(
    dir: &Path,
    path: &Path,
    bytes: Vec<u8>,
    overwrite: bool,
) -> CacheResult<bool> {
    let dir = dir.to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> CacheResult<bool> {
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| CacheError::io(format!("Failed to create cache file: {e}")))?;
        temp.write_all(&bytes)
            .map_err(|e| CacheError::io(format!("Failed to write cache file: {e}")))?;
        temp.flush()
            .map_err(|e| CacheError::io(format!("Failed to flush cache file: {e}")))?;

        let persisted = if overwrite {
            temp.persist(&path)
        } else {
            temp.persist_noclobber(&path)
        };

        match persisted {
            Ok(_) => Ok(true),
            Err(e) if !overwrite && e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(false)
            }
            Err(e) => Err(CacheError::io(format!(
                "Failed to move cache file into place: {}",
                e.error
            ))),
        }
    })
    .await
    .map_err(|e| CacheError::io(format!("Disk write task panicked: {e}")))?
}

fn is_cache_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == CACHE_FILE_EXTENSION)
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEMP_PREFIX))
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "linuxmobile", "pictor").map_or_else(
        || {
            std::env::temp_dir()
                .join("pictor")
                .join("cache")
                .join("images")
        },
        |dirs| dirs.cache_dir().join("images"),
    )
}
