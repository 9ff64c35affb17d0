//! Named image transforms.
//!
//! A transform maps either encoded bytes or an already decoded image to a
//! new image. Its name is part of the cache key, so two transforms that can
//! render differently must never share a name.

mod corner_radii;
pub mod filters;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use image::DynamicImage;
use regex::Regex;

use crate::domain::errors::{CacheError, CacheResult};

pub use corner_radii::CornerRadii;
use corner_radii::sanitize_radius;

/// Validated transform name: non-empty, `[A-Za-z0-9._-]` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformName(String);

impl TransformName {
    /// Creates a name after checking it is safe for cache keys and filenames.
    ///
    /// # Errors
    /// Returns `CacheError::InvalidTransformName` if the name is empty or
    /// contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(name: impl Into<String>) -> CacheResult<Self> {
        static NAME_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid name regex"));

        let name = name.into();
        if name.is_empty() {
            return Err(CacheError::InvalidTransformName {
                name,
                reason: "name must not be empty".to_string(),
            });
        }
        if !NAME_RE.is_match(&name) {
            return Err(CacheError::InvalidTransformName {
                name,
                reason: "only ASCII letters, digits, '.', '-' and '_' are allowed".to_string(),
            });
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransformName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability implemented by custom transforms.
///
/// `apply_to_bytes` is used when the source came from disk or network;
/// `apply_to_image` when a decoded image is already in memory.
pub trait ImageTransform: Send + Sync {
    /// Stable cache-key fragment for this transform and its parameters.
    fn name(&self) -> &TransformName;

    /// Decodes and transforms raw bytes.
    ///
    /// # Errors
    /// Returns `CacheError::Decode` for undecodable bytes, or
    /// `CacheError::Transform` if the transform's own logic fails.
    fn apply_to_bytes(&self, bytes: &[u8]) -> CacheResult<DynamicImage> {
        let image = filters::decode(bytes)?;
        Ok(self.apply_to_image(&image))
    }

    /// Transforms an already decoded image.
    fn apply_to_image(&self, image: &DynamicImage) -> DynamicImage;
}

/// A transform applied to fetched images before caching.
#[derive(Clone, Default)]
pub enum Transform {
    /// Leaves the image untouched.
    #[default]
    Identity,
    /// Gaussian blur with the given radius.
    Blur {
        /// Blur radius (sigma).
        radius: f32,
    },
    /// Rounded corners with independent radii.
    RoundedCorners(CornerRadii),
    /// Grayscale conversion.
    Grayscale,
    /// Centered square crop masked to a circle.
    Circular,
    /// Caller-provided transform.
    Custom(Arc<dyn ImageTransform>),
}

impl Transform {
    /// Name of the identity transform.
    pub const IDENTITY_NAME: &'static str = "identity";

    /// The no-op transform.
    #[must_use]
    pub const fn identity() -> Self {
        Self::Identity
    }

    /// Blur with `radius`. Negative or NaN radii become zero.
    #[must_use]
    pub fn blur(radius: f32) -> Self {
        Self::Blur {
            radius: sanitize_radius(radius),
        }
    }

    /// Rounded corners with independent radii.
    #[must_use]
    pub const fn rounded_corners(radii: CornerRadii) -> Self {
        Self::RoundedCorners(radii)
    }

    /// Rounded corners with the same radius everywhere.
    #[must_use]
    pub fn rounded(radius: f32) -> Self {
        Self::RoundedCorners(CornerRadii::uniform(radius))
    }

    /// Grayscale conversion.
    #[must_use]
    pub const fn grayscale() -> Self {
        Self::Grayscale
    }

    /// Circular crop.
    #[must_use]
    pub const fn circular() -> Self {
        Self::Circular
    }

    /// Wraps a custom transform.
    #[must_use]
    pub fn custom(transform: impl ImageTransform + 'static) -> Self {
        Self::Custom(Arc::new(transform))
    }

    /// Returns true for the identity transform.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Returns the cache-key fragment for this transform.
    #[must_use]
    pub fn name(&self) -> TransformName {
        match self {
            Self::Identity => TransformName(Self::IDENTITY_NAME.to_string()),
            Self::Blur { radius } => TransformName(format!("blur_r{}", sanitize_radius(*radius))),
            Self::RoundedCorners(radii) => TransformName(radii.name_fragment()),
            Self::Grayscale => TransformName("grayscale".to_string()),
            Self::Circular => TransformName("circle".to_string()),
            Self::Custom(custom) => custom.name().clone(),
        }
    }

    /// Decodes and transforms raw bytes.
    ///
    /// # Errors
    /// Returns `CacheError::Decode` for undecodable bytes, or whatever a
    /// custom transform reports.
    pub fn apply_to_bytes(&self, bytes: &[u8]) -> CacheResult<DynamicImage> {
        match self {
            Self::Identity => filters::decode(bytes),
            Self::Custom(custom) => custom.apply_to_bytes(bytes),
            _ => Ok(self.apply_to_image(&filters::decode(bytes)?)),
        }
    }

    /// Transforms an already decoded image.
    #[must_use]
    pub fn apply_to_image(&self, image: &DynamicImage) -> DynamicImage {
        match self {
            Self::Identity => image.clone(),
            Self::Blur { radius } => filters::blur(image, *radius),
            Self::RoundedCorners(radii) => filters::round_corners(image, radii),
            Self::Grayscale => filters::grayscale(image),
            Self::Circular => filters::circle(image),
            Self::Custom(custom) => custom.apply_to_image(image),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.name().0).finish()
    }
}

/// Parses `identity`, `grayscale`, `circle`, `blur:R`, `corners:R` or
/// `corners:TL,TR,BL,BR`.
impl FromStr for Transform {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CacheError::InvalidTransformSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let (kind, args) = s.split_once(':').unwrap_or((s, ""));
        let radii: Vec<f32> = if args.is_empty() {
            Vec::new()
        } else {
            args.split(',')
                .map(|v| v.trim().parse::<f32>())
                .collect::<Result<_, _>>()
                .map_err(|_| invalid("radius must be a number"))?
        };

        match (kind.trim().to_ascii_lowercase().as_str(), radii.as_slice()) {
            ("identity" | "none", []) => Ok(Self::Identity),
            ("grayscale" | "gray", []) => Ok(Self::Grayscale),
            ("circle" | "circular", []) => Ok(Self::Circular),
            ("blur", [radius]) => Ok(Self::blur(*radius)),
            ("corners" | "rounded", [radius]) => Ok(Self::rounded(*radius)),
            ("corners" | "rounded", [tl, tr, bl, br]) => {
                Ok(Self::rounded_corners(CornerRadii::new(*tl, *tr, *bl, *br)))
            }
            ("blur" | "corners" | "rounded", _) => Err(invalid("wrong number of radii")),
            _ => Err(invalid("unknown transform")),
        }
    }
}
