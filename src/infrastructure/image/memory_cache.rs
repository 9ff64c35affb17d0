//! In-memory LRU image cache implementation.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::DynamicImage;
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::domain::entities::CacheKey;
use crate::domain::ports::ImageCachePort;

/// Default maximum number of images to cache in memory.
pub const DEFAULT_CACHE_SIZE: usize = 50;

/// In-memory LRU cache for decoded, already transformed images.
/// Thread-safe; eviction happens on whichever task inserts past capacity.
pub struct MemoryImageCache {
    cache: RwLock<LruCache<CacheKey, Arc<DynamicImage>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a new cache with the specified capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: self.len(),
        }
    }

    /// Returns true if `key` is cached, without promoting it.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        self.cache.read().await.contains(key)
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images, {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.hit_rate, self.hits, self.misses
        )
    }
}

#[async_trait::async_trait]
impl ImageCachePort for MemoryImageCache {
    async fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let mut cache = self.cache.write().await;
        if let Some(img) = cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(img.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    async fn peek(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let cache = self.cache.read().await;
        cache.peek(key).cloned()
    }

    async fn put(&self, key: CacheKey, image: Arc<DynamicImage>) {
        let mut cache = self.cache.write().await;
        debug!(key = %key, "Storing image in memory cache");
        if let Some((evicted, _)) = cache.push(key.clone(), image)
            && evicted != key
        {
            trace!(key = %evicted, "Evicted least recently used image");
        }
    }

    async fn evict(&self, key: &CacheKey) {
        let mut cache = self.cache.write().await;
        if cache.pop(key).is_some() {
            debug!(key = %key, "Evicted image from memory cache");
        }
    }

    fn len(&self) -> usize {
        // Best-effort: a writer holding the lock reads as empty.
        let cache = self.cache.try_read();
        cache.map(|c| c.len()).unwrap_or(0)
    }

    async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
        debug!("Cleared memory image cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transform::Transform;

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(&format!("https://example.com/{name}.png"), &Transform::identity())
    }

    #[tokio::test]
    async fn test_cache_put_and_get() {
        let cache = MemoryImageCache::new(10);
        let img = Arc::new(DynamicImage::new_rgb8(100, 100));

        cache.put(key("a"), img.clone()).await;
        let retrieved = cache.get(&key("a")).await;

        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().width(), 100);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = MemoryImageCache::new(10);
        assert!(cache.get(&key("nonexistent")).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_eviction() {
        let cache = MemoryImageCache::new(2);
        let img = Arc::new(DynamicImage::new_rgb8(10, 10));

        cache.put(key("1"), img.clone()).await;
        cache.put(key("2"), img.clone()).await;
        cache.put(key("3"), img.clone()).await;

        // "1" is least recently used
        assert!(cache.get(&key("1")).await.is_none());
        assert!(cache.get(&key("2")).await.is_some());
        assert!(cache.get(&key("3")).await.is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_key() {
        let cache = MemoryImageCache::new(2);
        cache
            .put(key("a"), Arc::new(DynamicImage::new_rgb8(1, 1)))
            .await;
        cache
            .put(key("a"), Arc::new(DynamicImage::new_rgb8(7, 7)))
            .await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&key("a")).await.unwrap().width(), 7);
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache = MemoryImageCache::new(10);
        cache
            .put(key("a"), Arc::new(DynamicImage::new_rgb8(10, 10)))
            .await;

        let _ = cache.get(&key("a")).await;
        let _ = cache.get(&key("missing")).await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_promote() {
        let cache = MemoryImageCache::new(2);
        let img = Arc::new(DynamicImage::new_rgb8(10, 10));

        cache.put(key("1"), img.clone()).await;
        cache.put(key("2"), img.clone()).await;

        let _ = cache.peek(&key("1")).await;
        cache.put(key("3"), img).await;

        assert!(cache.peek(&key("1")).await.is_none());
        assert!(cache.contains(&key("2")).await);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let cache = Arc::new(MemoryImageCache::new(8));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let k = key(&i.to_string());
                cache.put(k.clone(), Arc::new(DynamicImage::new_rgb8(1, 1))).await;
                let _ = cache.get(&k).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.len(), 8);
    }
}
