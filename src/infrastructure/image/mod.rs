//! Image cache engine.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching of raw bytes with atomic writes
//! - Fetch operations walking memory, disk and network
//! - The deduplicating cache façade and its worker pool

pub mod cache;
pub mod disk_cache;
pub mod in_flight;
pub mod memory_cache;
pub mod operation;

pub use cache::{FetchHandle, ImageCache, ImageCacheConfig, Subscription};
pub use disk_cache::{DiskImageCache, default_cache_dir};
pub use in_flight::InFlightTable;
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use operation::{
    FetchOperation, OperationContext, OperationFactory, SubscriberId, TieredOperationFactory,
};
