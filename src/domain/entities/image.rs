//! Domain types for fetched images and their provenance.

use std::sync::Arc;

use image::DynamicImage;

use crate::domain::errors::CacheError;

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSource {
    /// Loaded from in-memory LRU cache.
    MemoryCache,
    /// Loaded from disk cache.
    DiskCache,
    /// Downloaded from network.
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Terminal result delivered to each subscriber of a fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Served from the in-memory cache.
    SuccessFromMemoryCache(Arc<DynamicImage>),
    /// Served from the disk cache.
    SuccessFromDiskCache(Arc<DynamicImage>),
    /// Downloaded from the URL.
    SuccessFromUrl(Arc<DynamicImage>),
    /// Resolution failed.
    Failed(CacheError),
    /// The subscriber, or every subscriber, withdrew interest.
    Cancelled,
}

impl FetchOutcome {
    /// Builds the success variant matching `source`.
    #[must_use]
    pub const fn success(source: ImageSource, image: Arc<DynamicImage>) -> Self {
        match source {
            ImageSource::MemoryCache => Self::SuccessFromMemoryCache(image),
            ImageSource::DiskCache => Self::SuccessFromDiskCache(image),
            ImageSource::Network => Self::SuccessFromUrl(image),
        }
    }

    /// Returns the image for any success variant.
    #[must_use]
    pub const fn image(&self) -> Option<&Arc<DynamicImage>> {
        match self {
            Self::SuccessFromMemoryCache(img)
            | Self::SuccessFromDiskCache(img)
            | Self::SuccessFromUrl(img) => Some(img),
            Self::Failed(_) | Self::Cancelled => None,
        }
    }

    /// Returns the tier that supplied the image.
    #[must_use]
    pub const fn source(&self) -> Option<ImageSource> {
        match self {
            Self::SuccessFromMemoryCache(_) => Some(ImageSource::MemoryCache),
            Self::SuccessFromDiskCache(_) => Some(ImageSource::DiskCache),
            Self::SuccessFromUrl(_) => Some(ImageSource::Network),
            Self::Failed(_) | Self::Cancelled => None,
        }
    }

    /// Returns the failure, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true for any success variant.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.source().is_some()
    }

    /// Returns true if the fetch was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuccessFromMemoryCache(_) => write!(f, "success (memory)"),
            Self::SuccessFromDiskCache(_) => write!(f, "success (disk)"),
            Self::SuccessFromUrl(_) => write!(f, "success (network)"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Execution state of a fetch operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OperationState {
    /// Created, not yet picked up by a worker.
    #[default]
    Pending,
    /// Consulting the given tier.
    Resolving(ImageSource),
    /// Finished with an image from the given tier.
    Succeeded(ImageSource),
    /// Finished with an error.
    Failed(CacheError),
    /// Every subscriber withdrew.
    Cancelled,
}

impl OperationState {
    /// Returns true once no further transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_) | Self::Cancelled)
    }

    /// Terminal state matching a delivered outcome.
    #[must_use]
    pub fn from_outcome(outcome: &FetchOutcome) -> Self {
        match outcome {
            FetchOutcome::Failed(e) => Self::Failed(e.clone()),
            FetchOutcome::Cancelled => Self::Cancelled,
            success => success.source().map_or(Self::Cancelled, Self::Succeeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img() -> Arc<DynamicImage> {
        Arc::new(DynamicImage::new_rgb8(1, 1))
    }

    #[test]
    fn test_success_tags_provenance() {
        for source in [
            ImageSource::MemoryCache,
            ImageSource::DiskCache,
            ImageSource::Network,
        ] {
            let outcome = FetchOutcome::success(source, img());
            assert_eq!(outcome.source(), Some(source));
            assert!(outcome.is_success());
            assert!(outcome.image().is_some());
        }
    }

    #[test]
    fn test_failure_and_cancel_have_no_image() {
        let failed = FetchOutcome::Failed(CacheError::transport("down"));
        assert!(failed.image().is_none());
        assert!(failed.error().is_some());
        assert!(!failed.is_success());

        assert!(FetchOutcome::Cancelled.is_cancelled());
        assert!(FetchOutcome::Cancelled.image().is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::Resolving(ImageSource::Network).is_terminal());
        assert!(OperationState::Cancelled.is_terminal());
        assert_eq!(
            OperationState::from_outcome(&FetchOutcome::success(ImageSource::DiskCache, img())),
            OperationState::Succeeded(ImageSource::DiskCache)
        );
    }
}
