mod http_port;
mod image_cache_port;

pub use http_port::{HttpResponse, HttpTransport};
pub use image_cache_port::ImageCachePort;

#[cfg(test)]
pub use http_port::MockHttpTransport;
