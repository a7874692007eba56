//! Rendering-engine boundary.
//!
//! The range loader hands a [`PdfEngine`] either the complete file or the
//! first chunk plus a [`RangeReader`] for the rest. The engine opens a
//! [`PdfDocument`] from that and asks for more bytes only when a page needs
//! them. Parsing beyond page count and page geometry is the engine's
//! business, not the loader's.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::cache::BoxFuture;
use crate::error::StreamingError;

/// Errors raised while opening or reading a document.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("malformed document: {0}")]
    Malformed(String),

    /// Progressive opening needs a linearization dictionary in the first chunk.
    #[error("document is not linearized")]
    NotLinearized,

    #[error("page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: u32, count: u32 },

    /// Fetching more bytes failed.
    #[error("{0}")]
    Source(StreamingError),
}

impl From<StreamingError> for EngineError {
    fn from(e: StreamingError) -> Self {
        EngineError::Source(e)
    }
}

/// Random access to the bytes of a remote document.
pub trait RangeReader: Send + Sync {
    fn total_bytes(&self) -> u64;

    /// Bytes `start..=end`.
    fn read_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, StreamingError>>;
}

/// What the engine opens a document from.
pub enum DocumentSource {
    /// The whole file.
    Complete(Bytes),
    /// The first chunk, with a reader for the rest.
    Progressive {
        initial: Bytes,
        total_bytes: u64,
        reader: Arc<dyn RangeReader>,
    },
}

/// Geometry and location of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// 1-based.
    pub number: u32,
    pub width: f32,
    pub height: f32,
    /// Byte window holding the page's objects.
    pub offset: u64,
    pub length: u64,
}

/// An opened document.
pub trait PdfDocument: Send + Sync {
    fn page_count(&self) -> u32;

    /// Stable identity derived from the file contents.
    fn fingerprint(&self) -> &str;

    fn total_bytes(&self) -> u64;

    /// Page `number` (1-based), fetching its bytes if needed.
    fn page(&self, number: u32) -> BoxFuture<'_, Result<PageInfo, EngineError>>;
}

/// Opens documents.
pub trait PdfEngine: Send + Sync {
    fn open(&self, source: DocumentSource) -> BoxFuture<'_, Result<Arc<dyn PdfDocument>, EngineError>>;
}

/// US Letter, used when a page declares no MediaBox.
pub const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

/// Bytes hashed for the fingerprint.
const FINGERPRINT_PREFIX: usize = 64 * 1024;

fn linearized_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<<[^>]*/Linearized[^>]*/N\s+(\d+)").unwrap())
}

fn page_tree_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/Type\s*/Pages\b[^>]*/Count\s+(\d+)").unwrap())
}

fn media_box_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let n = r"(-?\d+(?:\.\d+)?)";
        Regex::new(&format!(r"/MediaBox\s*\[\s*{n}\s+{n}\s+{n}\s+{n}\s*\]")).unwrap()
    })
}

fn capture_u32(pattern: &Regex, haystack: &[u8]) -> Option<u32> {
    let caps = pattern.captures(haystack)?;
    std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.parse().ok()
}

fn media_box(window: &[u8]) -> Option<(f32, f32)> {
    let caps = media_box_pattern().captures(window)?;
    let value = |i: usize| -> Option<f32> {
        std::str::from_utf8(caps.get(i)?.as_bytes()).ok()?.parse().ok()
    };
    let (x0, y0, x1, y1) = (value(1)?, value(2)?, value(3)?, value(4)?);
    Some(((x1 - x0).abs(), (y1 - y0).abs()))
}

fn fingerprint(prefix: &[u8], total_bytes: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&prefix[..prefix.len().min(FINGERPRINT_PREFIX)]);
    hasher.update(total_bytes.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Minimal engine: header check, page count from the linearization
/// dictionary or the page tree, page size from the nearest MediaBox.
///
/// A progressive source must be linearized; otherwise the page tree could be
/// anywhere in the file and opening fails with [`EngineError::NotLinearized`].
///
/// Pages are assumed to be laid out evenly through the file, which holds for
/// linearized files closely enough to pick the right chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicPdfEngine;

enum Body {
    Complete(Bytes),
    Ranged(Arc<dyn RangeReader>),
}

struct BasicDocument {
    body: Body,
    total_bytes: u64,
    page_count: u32,
    fingerprint: String,
}

impl BasicPdfEngine {
    async fn open_source(source: DocumentSource) -> Result<Arc<dyn PdfDocument>, EngineError> {
        let (head, total_bytes) = match &source {
            DocumentSource::Complete(bytes) => (bytes.clone(), bytes.len() as u64),
            DocumentSource::Progressive {
                initial,
                total_bytes,
                ..
            } => (initial.clone(), *total_bytes),
        };

        if !head.starts_with(b"%PDF-") {
            return Err(EngineError::Malformed("missing %PDF- header".to_string()));
        }

        let mut page_count = capture_u32(linearized_pattern(), &head);
        let body = match source {
            DocumentSource::Complete(bytes) => {
                if page_count.is_none() {
                    page_count = capture_u32(page_tree_pattern(), &bytes);
                }
                Body::Complete(bytes)
            }
            DocumentSource::Progressive { reader, .. } => {
                if page_count.is_none() {
                    debug!(total_bytes, "No linearization dictionary in the first chunk");
                    return Err(EngineError::NotLinearized);
                }
                Body::Ranged(reader)
            }
        };

        let page_count = match page_count {
            Some(count) if count > 0 => count,
            _ => return Err(EngineError::Malformed("page count not found".to_string())),
        };

        Ok(Arc::new(BasicDocument {
            fingerprint: fingerprint(&head, total_bytes),
            body,
            total_bytes,
            page_count,
        }))
    }
}

impl PdfEngine for BasicPdfEngine {
    fn open(&self, source: DocumentSource) -> BoxFuture<'_, Result<Arc<dyn PdfDocument>, EngineError>> {
        Box::pin(Self::open_source(source))
    }
}

impl BasicDocument {
    fn window(&self, number: u32) -> (u64, u64) {
        let region = (self.total_bytes / self.page_count as u64).max(1);
        let offset = ((number as u64 - 1) * region).min(self.total_bytes.saturating_sub(1));
        let remaining = self.total_bytes - offset;
        let length = if number == self.page_count {
            remaining
        } else {
            region.min(remaining)
        };
        (offset, length)
    }
}

impl PdfDocument for BasicDocument {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn page(&self, number: u32) -> BoxFuture<'_, Result<PageInfo, EngineError>> {
        Box::pin(async move {
            if number == 0 || number > self.page_count {
                return Err(EngineError::PageOutOfRange {
                    page: number,
                    count: self.page_count,
                });
            }

            let (offset, length) = self.window(number);
            let window = match &self.body {
                Body::Complete(bytes) => bytes.slice(offset as usize..(offset + length) as usize),
                Body::Ranged(reader) => reader.read_range(offset, offset + length - 1).await?,
            };
            let (width, height) = media_box(&window).unwrap_or(DEFAULT_PAGE_SIZE);

            Ok(PageInfo {
                number,
                width,
                height,
                offset,
                length,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_pdf;
    use parking_lot::Mutex;

    struct SliceReader {
        data: Bytes,
        reads: Mutex<Vec<(u64, u64)>>,
    }

    impl RangeReader for SliceReader {
        fn total_bytes(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, StreamingError>> {
            self.reads.lock().push((start, end));
            Box::pin(async move { Ok(self.data.slice(start as usize..=end as usize)) })
        }
    }

    fn progressive(data: Vec<u8>, initial: usize) -> (DocumentSource, Arc<SliceReader>) {
        let data = Bytes::from(data);
        let reader = Arc::new(SliceReader {
            data: data.clone(),
            reads: Mutex::new(Vec::new()),
        });
        let source = DocumentSource::Progressive {
            initial: data.slice(..initial),
            total_bytes: data.len() as u64,
            reader: reader.clone(),
        };
        (source, reader)
    }

    #[tokio::test]
    async fn test_rejects_non_pdf() {
        let err = BasicPdfEngine
            .open(DocumentSource::Complete(Bytes::from_static(b"<html>")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_linearized_open_reads_only_initial_chunk() {
        let (source, reader) = progressive(sample_pdf(12, 200_000, true), 65_536);
        let doc = BasicPdfEngine.open(source).await.unwrap();
        assert_eq!(doc.page_count(), 12);
        assert!(reader.reads.lock().is_empty());

        let page = doc.page(7).await.unwrap();
        assert_eq!((page.width, page.height), (595.0, 842.0));
        assert_eq!(reader.reads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_plain_document_needs_complete_source() {
        let data = sample_pdf(4, 100_000, false);
        let (source, reader) = progressive(data.clone(), 65_536);
        let err = BasicPdfEngine.open(source).await.err().unwrap();
        assert_eq!(err, EngineError::NotLinearized);
        assert!(reader.reads.lock().is_empty());

        let doc = BasicPdfEngine
            .open(DocumentSource::Complete(Bytes::from(data)))
            .await
            .unwrap();
        assert_eq!(doc.page_count(), 4);
    }

    #[tokio::test]
    async fn test_fingerprint_matches_between_sources() {
        let data = sample_pdf(3, 150_000, true);
        let complete = BasicPdfEngine
            .open(DocumentSource::Complete(Bytes::from(data.clone())))
            .await
            .unwrap();
        let (source, _) = progressive(data, 65_536);
        let ranged = BasicPdfEngine.open(source).await.unwrap();
        assert_eq!(complete.fingerprint(), ranged.fingerprint());
    }

    #[tokio::test]
    async fn test_page_out_of_range() {
        let doc = BasicPdfEngine
            .open(DocumentSource::Complete(Bytes::from(sample_pdf(2, 10_000, true))))
            .await
            .unwrap();
        let err = doc.page(3).await.unwrap_err();
        assert_eq!(err, EngineError::PageOutOfRange { page: 3, count: 2 });
    }
}
