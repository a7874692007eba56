//! Fire-and-forget metrics.
//!
//! Loaders report `(name, value)` pairs to a [`MetricsSink`]. Sinks must not
//! block and must never fail the caller.

use tracing::debug;

/// Metric names emitted by the library.
pub mod metric {
    /// Milliseconds from `open_document` to `Ready` for an EPUB.
    pub const EPUB_OPEN_MS: &str = "epub.open_ms";
    /// Milliseconds from `open_document` to `Ready` for a PDF.
    pub const PDF_OPEN_MS: &str = "pdf.open_ms";
    /// Milliseconds spent fetching one chapter from the network.
    pub const CHAPTER_FETCH_MS: &str = "chapter.fetch_ms";
    /// Bytes fetched for one PDF chunk.
    pub const PDF_CHUNK_BYTES: &str = "pdf.chunk_bytes";
    pub const CACHE_HIT: &str = "cache.hit";
    pub const CACHE_MISS: &str = "cache.miss";
}

/// Receiver of numeric measurements.
pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &'static str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _name: &'static str, _value: f64) {}
}

/// Emits each measurement as a debug-level tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, name: &'static str, value: f64) {
        debug!(target: "bookstream::metrics", metric = name, value, "metric");
    }
}
