//! Cache key derivation.

use sha2::{Digest, Sha256};

use crate::domain::transform::Transform;

/// Extension of disk cache files.
pub const CACHE_FILE_EXTENSION: &str = "img";

/// Deterministic identifier for a `(url, transform)` pair.
///
/// Format: 32 hex characters of the URL's SHA-256, `_`, then the transform
/// name. URLs are not normalized, so any textual difference yields a
/// different key. The key is used unchanged as the memory-cache key and as
/// the basis of the disk filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for `url` under `transform`.
    #[must_use]
    pub fn derive(url: &str, transform: &Transform) -> Self {
        Self(format!("{}_{}", url_digest(url), transform.name()))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the disk cache filename for this key.
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}.{CACHE_FILE_EXTENSION}", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hex-encoded first 16 bytes of the URL's SHA-256.
#[must_use]
pub fn url_digest(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}
