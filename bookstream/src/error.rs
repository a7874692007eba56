//! Streaming error model shared by both loaders.
//!
//! Every failure that reaches the rendering engine is a [`StreamingError`]:
//! a kind, a human-readable message, whether a retry is worth offering, and
//! how many retries were already spent. Lower layers keep their own
//! `thiserror` enums and convert into this shape at the loader boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::network::TransportError;
use crate::pdf::EngineError;

/// Category of a streaming failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection failed or the server answered with a non-success status.
    Network,
    /// An operation exceeded its deadline or the transport was aborted.
    Timeout,
    /// Fetched bytes could not be interpreted as a document.
    Parsing,
    /// The metadata pass failed or timed out.
    Metadata,
    /// A streaming session failed after the document was opened.
    Streaming,
    /// The server does not honour byte-range requests.
    RangeNotSupported,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Metadata => "metadata",
            ErrorKind::Streaming => "streaming",
            ErrorKind::RangeNotSupported => "range_not_supported",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Short recovery hint the UI may show next to the error message.
    pub fn guidance(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Check your connection and try again.",
            ErrorKind::Timeout => "The server is slow to respond. Try again or use a faster server.",
            ErrorKind::Parsing => "The document appears to be damaged or in an unsupported format.",
            ErrorKind::Metadata => "The document details could not be read. Try opening it again.",
            ErrorKind::Streaming => "Loading was interrupted. Try opening the document again.",
            ErrorKind::RangeNotSupported => "The server does not support partial downloads.",
            ErrorKind::Unknown => "Something went wrong while loading the document.",
        }
    }

    /// Whether errors of this kind are retried by default.
    pub fn default_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::Parsing)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, user-presentable loading failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct StreamingError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying may succeed.
    pub recoverable: bool,
    /// Retries already spent before this error was surfaced.
    pub retry_count: u32,
}

impl StreamingError {
    /// Create an error of the given kind with the kind's default recoverability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.default_recoverable(),
            retry_count: 0,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, message)
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Metadata, message)
    }

    pub fn streaming(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Streaming, message)
    }

    pub fn range_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeNotSupported, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// The session was cancelled by its owner. Never retried.
    pub fn aborted() -> Self {
        Self::streaming("loading was aborted").with_recoverable(false)
    }

    /// Override recoverability.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Record how many retries were spent.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Recovery hint for this error's kind.
    pub fn guidance(&self) -> &'static str {
        self.kind.guidance()
    }
}

impl From<TransportError> for StreamingError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout { .. } | TransportError::Aborted => {
                StreamingError::timeout(e.to_string())
            }
            TransportError::InvalidRequest(_) => {
                StreamingError::network(e.to_string()).with_recoverable(false)
            }
            TransportError::Connect(_) | TransportError::Body(_) => {
                StreamingError::network(e.to_string())
            }
        }
    }
}

impl From<EngineError> for StreamingError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Source(inner) => inner,
            EngineError::NotLinearized => {
                StreamingError::range_not_supported(EngineError::NotLinearized.to_string())
            }
            other => StreamingError::parsing(other.to_string()),
        }
    }
}

impl From<CacheError> for StreamingError {
    fn from(e: CacheError) -> Self {
        StreamingError::streaming(format!("cache failure: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = StreamingError::network("HTTP 503 from https://books.example/a.pdf");
        assert_eq!(
            err.to_string(),
            "network error: HTTP 503 from https://books.example/a.pdf"
        );
    }

    #[test]
    fn test_parsing_is_not_recoverable_by_default() {
        assert!(!StreamingError::parsing("bad xref").recoverable);
        assert!(StreamingError::network("reset").recoverable);
        assert!(StreamingError::timeout("slow").recoverable);
        assert!(StreamingError::metadata("slow").recoverable);
    }

    #[test]
    fn test_aborted_is_terminal() {
        let err = StreamingError::aborted();
        assert_eq!(err.kind, ErrorKind::Streaming);
        assert!(!err.recoverable);
    }

    #[test]
    fn test_transport_timeout_maps_to_timeout_kind() {
        let err: StreamingError = TransportError::Timeout {
            url: "https://books.example/a.epub".to_string(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Timeout);

        let err: StreamingError = TransportError::Aborted.into();
        assert_eq!(err.kind, ErrorKind::Timeout);

        let err: StreamingError = TransportError::Connect("refused".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Network);
    }

    #[test]
    fn test_engine_source_error_passes_through() {
        let inner = StreamingError::network("chunk 3 failed");
        let err: StreamingError = EngineError::Source(inner.clone()).into();
        assert_eq!(err, inner);

        let err: StreamingError = EngineError::Malformed("missing header".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Parsing);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ErrorKind::RangeNotSupported.as_str(), "range_not_supported");
        let json = serde_json::to_string(&ErrorKind::RangeNotSupported).unwrap();
        assert_eq!(json, "\"range_not_supported\"");
    }

    #[test]
    fn test_guidance_differs_between_timeout_and_network() {
        assert_ne!(ErrorKind::Timeout.guidance(), ErrorKind::Network.guidance());
    }
}
