//! Port definition for the in-memory image tier.

use std::sync::Arc;

use image::DynamicImage;

use crate::domain::entities::CacheKey;

/// Port for decoded-image caching keyed by `CacheKey`.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Attempts to get an image from the cache, promoting it.
    /// Returns None if not cached.
    async fn get(&self, key: &CacheKey) -> Option<Arc<DynamicImage>>;

    /// Looks up an image without affecting eviction order.
    async fn peek(&self, key: &CacheKey) -> Option<Arc<DynamicImage>>;

    /// Stores an image in the cache.
    async fn put(&self, key: CacheKey, image: Arc<DynamicImage>);

    /// Removes an image from the cache.
    async fn evict(&self, key: &CacheKey);

    /// Returns the current number of cached images.
    fn len(&self) -> usize;

    /// Returns true if the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears all images from the cache.
    async fn clear(&self);
}
