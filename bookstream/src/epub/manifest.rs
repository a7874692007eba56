//! HTTP collaborators for exploded EPUBs.
//!
//! An exploded EPUB is served as a directory: `{base}/manifest.json`
//! describes the package, and each spine `href` resolves to `{base}/{href}`.
//!
//! ```json
//! {
//!   "title": "Persuasion",
//!   "author": "Jane Austen",
//!   "identifier": "urn:isbn:9780141439686",
//!   "language": "en",
//!   "toc": [{ "label": "Chapter 1", "href": "ch1.xhtml" }],
//!   "spine": [{ "href": "ch1.xhtml" }]
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::chapters::ChapterSource;
use super::metadata::{RawStructure, StructureReader};
use crate::cache::BoxFuture;
use crate::error::StreamingError;
use crate::network::{ensure_success, HttpRequest, HttpTransport};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Join a book base URL and a relative href.
pub fn resolve(base: &str, href: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        href.trim_start_matches('/')
    )
}

async fn get(transport: &dyn HttpTransport, url: &str) -> Result<Bytes, StreamingError> {
    let response = transport.send(HttpRequest::get(url), None).await?;
    Ok(ensure_success(response, url)?.body)
}

/// Reads `manifest.json` next to the book.
pub struct ManifestStructureReader {
    transport: Arc<dyn HttpTransport>,
}

impl ManifestStructureReader {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

impl StructureReader for ManifestStructureReader {
    fn read_structure<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<RawStructure, StreamingError>> {
        Box::pin(async move {
            let manifest_url = resolve(url, MANIFEST_FILE);
            let body = get(self.transport.as_ref(), &manifest_url).await?;
            serde_json::from_slice(&body).map_err(|e| {
                StreamingError::parsing(format!("invalid manifest at {}: {}", manifest_url, e))
            })
        })
    }
}

/// Fetches chapter bodies from `{base}/{href}`.
pub struct HttpChapterSource {
    transport: Arc<dyn HttpTransport>,
}

impl HttpChapterSource {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

impl ChapterSource for HttpChapterSource {
    fn fetch_chapter<'a>(
        &'a self,
        book_url: &'a str,
        href: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, StreamingError>> {
        Box::pin(async move { get(self.transport.as_ref(), &resolve(book_url, href)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::{serve_epub, MockTransport};

    #[test]
    fn test_resolve_normalizes_slashes() {
        assert_eq!(
            resolve("https://books.example/emma/", "/text/ch1.xhtml"),
            "https://books.example/emma/text/ch1.xhtml"
        );
    }

    #[tokio::test]
    async fn test_reads_manifest() {
        let transport = MockTransport::new();
        serve_epub(&transport, "https://books.example/emma", "urn:emma", 3);
        let reader = ManifestStructureReader::new(Arc::new(transport));

        let raw = reader
            .read_structure("https://books.example/emma")
            .await
            .unwrap();
        assert_eq!(raw.identifier.as_deref(), Some("urn:emma"));
        assert_eq!(raw.spine.len(), 3);
        assert_eq!(raw.table_of_contents[2].label, "Chapter 3");
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_parsing_error() {
        let transport = MockTransport::new();
        transport.add_resource("https://books.example/x/manifest.json", b"<xml/>".to_vec());
        let reader = ManifestStructureReader::new(Arc::new(transport));

        let err = reader.read_structure("https://books.example/x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parsing);
    }

    #[tokio::test]
    async fn test_missing_chapter_is_network_error() {
        let source = HttpChapterSource::new(Arc::new(MockTransport::new()));
        let err = source
            .fetch_chapter("https://books.example/x", "ch9.xhtml")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
    }
}
