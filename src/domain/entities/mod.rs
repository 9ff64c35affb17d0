//! Domain entity definitions.

mod cache_key;
mod fetch_request;
mod image;

pub use cache_key::{CACHE_FILE_EXTENSION, CacheKey, url_digest};
pub use fetch_request::FetchRequest;
pub use image::{FetchOutcome, ImageSource, OperationState};
