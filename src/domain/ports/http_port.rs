//! Port definition for the HTTP transport collaborator.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::errors::CacheResult;

/// Raw response of a GET request.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a 200 response with the given body.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Creates a response with the given status and an empty body.
    #[must_use]
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the first header value with the given (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Port for performing GET requests.
///
/// Implementations report transport failures (including their own timeout)
/// as errors and return every HTTP status, successful or not, as a response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetches `url`.
    async fn get(&self, url: &str) -> CacheResult<HttpResponse>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        assert!(HttpResponse::ok("x").is_success());
        assert!(HttpResponse::with_status(204).is_success());
        assert!(!HttpResponse::with_status(304).is_success());
        assert!(!HttpResponse::with_status(500).is_success());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse {
            headers: vec![("content-type".into(), "image/png".into())],
            ..HttpResponse::ok("x")
        };
        assert_eq!(response.header("Content-Type"), Some("image/png"));
        assert_eq!(response.header("etag"), None);
    }
}
