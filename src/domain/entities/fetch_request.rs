//! Per-call fetch parameters.

use crate::domain::transform::Transform;

use super::CacheKey;

/// Parameters of one request for a transformed remote image.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Image URL, used verbatim.
    pub url: String,
    /// Transform applied before caching.
    pub transform: Transform,
    /// Skip memory and disk reads and go to the network.
    pub refresh: bool,
    /// Read from and write to the disk tier.
    pub use_disk_cache: bool,
}

impl FetchRequest {
    /// Creates a request with the identity transform and default flags.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transform: Transform::identity(),
            refresh: false,
            use_disk_cache: true,
        }
    }

    /// Sets the transform.
    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Forces a network fetch.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Enables or disables the disk tier.
    #[must_use]
    pub const fn with_disk_cache(mut self, use_disk_cache: bool) -> Self {
        self.use_disk_cache = use_disk_cache;
        self
    }

    /// Derives the cache key for this request.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::derive(&self.url, &self.transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request = FetchRequest::new("https://x/img.png");
        assert!(request.transform.is_identity());
        assert!(!request.refresh);
        assert!(request.use_disk_cache);
    }

    #[test]
    fn test_key_ignores_flags() {
        let plain = FetchRequest::new("https://x/img.png").with_transform(Transform::grayscale());
        let refreshed = plain.clone().with_refresh(true).with_disk_cache(false);
        assert_eq!(plain.cache_key(), refreshed.cache_key());
    }
}
