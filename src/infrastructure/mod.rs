//! Infrastructure layer with external service adapters.

/// Application configuration.
pub mod config;
/// HTTP transport.
pub mod http;
/// Image caching (memory, disk, fetch operations).
pub mod image;

pub use config::{AppConfig, CliArgs, ConfigStore, LogLevel};
pub use http::ReqwestTransport;
pub use image::{
    CacheStats, DiskImageCache, FetchHandle, ImageCache, ImageCacheConfig, MemoryImageCache,
    Subscription,
};
