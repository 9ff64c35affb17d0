//! `reqwest`-backed image transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::{HttpResponse, HttpTransport};
use crate::infrastructure::image::ImageCacheConfig;

/// User agent sent when the configuration does not set one.
pub const DEFAULT_USER_AGENT: &str = concat!("pictor/", env!("CARGO_PKG_VERSION"));

/// Performs GET requests with a shared connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Creates a transport with the given request timeout and user agent.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> CacheResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Creates a transport from the cache configuration.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn from_config(config: &ImageCacheConfig) -> CacheResult<Self> {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
        )
    }

    fn map_error(url: &str, e: &reqwest::Error) -> CacheError {
        if e.is_timeout() {
            CacheError::Timeout {
                url: url.to_string(),
            }
        } else if e.is_connect() {
            CacheError::transport(format!("failed to connect: {e}"))
        } else {
            CacheError::transport(e.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> CacheResult<HttpResponse> {
        let response = self.client.get(url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Image request failed");
            Self::map_error(url, &e)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to read image body");
            Self::map_error(url, &e)
        })?;

        debug!(url = %url, status = status, size = body.len(), "Image response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP/1.1 response per connection.
    async fn serve(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/img.png")
    }

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new(Duration::from_secs(5), DEFAULT_USER_AGENT).unwrap()
    }

    #[tokio::test]
    async fn test_success_returns_body_and_headers() {
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 4\r\nConnection: close\r\n\r\nabcd",
        )
        .await;

        let response = transport().get(&url).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("image/png"));
        assert_eq!(&response.body[..], b"abcd");
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let url = serve("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        let response = transport().get(&url).await.unwrap();

        assert_eq!(response.status, 404);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport()
            .get(&format!("http://{addr}/img.png"))
            .await
            .unwrap_err();

        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let url = format!("http://{addr}/slow.png");
        let transport = ReqwestTransport::new(Duration::from_millis(100), DEFAULT_USER_AGENT).unwrap();

        let err = transport.get(&url).await.unwrap_err();

        assert_eq!(err, CacheError::Timeout { url });
    }
}
