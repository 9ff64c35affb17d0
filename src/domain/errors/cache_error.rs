//! Image cache error types.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while resolving or storing an image.
///
/// Cloneable so one failure can be fanned out to every subscriber of an
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum CacheError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("transform '{transform}' failed: {message}")]
    Transform { transform: String, message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("invalid transform name '{name}': {reason}")]
    InvalidTransformName { name: String, reason: String },

    #[error("invalid transform spec '{spec}': {reason}")]
    InvalidTransformSpec { spec: String, reason: String },

    #[error("image cache is shut down")]
    Shutdown,
}

impl CacheError {
    /// Creates transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates transform error.
    #[must_use]
    pub fn transform(transform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            transform: transform.into(),
            message: message.into(),
        }
    }

    /// Creates IO error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns whether the error came from the network collaborator.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::HttpStatus { .. } | Self::Timeout { .. }
        )
    }

    /// Returns whether the fetched bytes could not be turned into an image.
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}
