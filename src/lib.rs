//! Pictor - a transform-aware remote image cache.
//!
//! Images are resolved through an in-memory LRU tier, a disk tier of raw
//! downloaded bytes and finally the network. Concurrent requests for the
//! same URL and transform share a single fetch, and each request can be
//! cancelled independently.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, transforms and port definitions.
pub mod domain;
/// Infrastructure layer containing the cache engine and its adapters.
pub mod infrastructure;

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "pictor";
