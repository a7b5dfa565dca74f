//! HTTP client abstraction.
//!
//! The requestor talks to an [`HttpClient`] so tests and embedders can supply
//! their own transport. [`ReqwestClient`] is the default implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::time::Duration;

/// A received HTTP response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers in received order.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Looks up a header value, ignoring case of the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implementations report timeouts as `SyncError::Timeout` and other
/// connection failures as `SyncError::Transport`. Non-2xx statuses are not
/// errors at this level.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request.
    async fn get(&self, url: &str, headers: &[(String, String)]) -> SyncResult<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> SyncResult<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| map_error(url, e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| map_error(url, e))?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

pub(crate) fn map_error(url: &str, err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout {
            url: url.to_string(),
        }
    } else {
        SyncError::transport_retryable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse::new(200, "[]").with_header("ETag", "\"abc\"");
        assert_eq!(response.header("etag"), Some("\"abc\""));
        assert_eq!(response.header("ETAG"), Some("\"abc\""));
        assert_eq!(response.header("x-missing"), None);
        assert!(response.is_success());
        assert!(!HttpResponse::new(304, Vec::new()).is_success());
    }

    #[test]
    fn reqwest_client_builds() {
        assert!(ReqwestClient::new(Duration::from_secs(1)).is_ok());
    }
}
