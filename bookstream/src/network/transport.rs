//! HTTP transport abstraction.
//!
//! Loaders talk to the network only through [`HttpTransport`], so tests can
//! substitute an in-memory server. The transport does not judge status
//! codes; callers decide what a 200 to a range request means.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::cache::BoxFuture;
use crate::error::StreamingError;

/// Errors raised by a transport before a response is available.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request aborted")]
    Aborted,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Head => f.write_str("HEAD"),
        }
    }
}

/// Inclusive byte range, as in `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub range: Option<ByteRange>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            range: None,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Head,
            url: url.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// A complete response. Header names are stored lowercase.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Total size from `Content-Range: bytes 0-1/12345`. `*` totals are `None`.
    pub fn content_range_total(&self) -> Option<u64> {
        let value = self.header("content-range")?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    pub fn accepts_byte_ranges(&self) -> bool {
        self.header("accept-ranges")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes"))
    }
}

/// Called with `(bytes_received, expected_total)` while a body streams in.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Asynchronous HTTP client.
///
/// Dropping the returned future aborts the request.
pub trait HttpTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        progress: Option<&'a ProgressFn>,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

/// Map a non-2xx response to a `network` error.
pub fn ensure_success(response: HttpResponse, url: &str) -> Result<HttpResponse, StreamingError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(StreamingError::network(format!(
            "HTTP {} from {}",
            response.status, url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_byte_range_header() {
        let range = ByteRange::new(0, 65_535);
        assert_eq!(range.header_value(), "bytes=0-65535");
        assert_eq!(range.len(), 65_536);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(206, Bytes::new())
            .with_header("Content-Range", "bytes 0-1/2048")
            .with_header("Accept-Ranges", "Bytes");
        assert_eq!(response.content_range_total(), Some(2048));
        assert!(response.accepts_byte_ranges());
    }

    #[test]
    fn test_unknown_content_range_total() {
        let response = HttpResponse::new(206, Bytes::new()).with_header("content-range", "bytes 0-1/*");
        assert_eq!(response.content_range_total(), None);
    }

    #[test]
    fn test_ensure_success_maps_status_to_network_error() {
        let err = ensure_success(HttpResponse::new(503, Bytes::new()), "https://books.example/a")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.message.contains("503"));
    }
}
