//! Warm-cache collaborators.
//!
//! A warm-cache service prefetches popular books ahead of time. The metadata
//! extractor consults it through [`WarmCache`] but never depends on it: any
//! miss or failure falls through to a normal structure read.
//!
//! [`CoverPrefetcher`] is the writer side: it walks a list of popular books,
//! caches their covers as `cover:{id}` and leaves a `prefetch:{id}` record
//! that [`CacheWarmSource`] reads back.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{BoxFuture, CacheStore, CacheValue, EntryType};
use crate::epub::DocumentMetadata;
use crate::network::{ensure_success, HttpRequest, HttpTransport};

/// Default number of popular books warmed per run.
pub const DEFAULT_POPULAR_BOOKS: usize = 100;

/// Source of prefetched metadata.
pub trait WarmCache: Send + Sync {
    /// Prefetched metadata for `cache_key`, if any.
    fn prefetched_metadata<'a>(&'a self, cache_key: &'a str)
        -> BoxFuture<'a, Option<DocumentMetadata>>;
}

/// No warm-cache service.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWarmCache;

impl WarmCache for NoWarmCache {
    fn prefetched_metadata<'a>(
        &'a self,
        _cache_key: &'a str,
    ) -> BoxFuture<'a, Option<DocumentMetadata>> {
        Box::pin(async { None })
    }
}

/// What a HEAD request revealed about a book file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileInfo {
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub supports_ranges: bool,
}

/// Record stored under `prefetch:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefetchRecord {
    pub id: String,
    pub file: Option<RemoteFileInfo>,
    pub document: Option<DocumentMetadata>,
    pub cover_cached: bool,
    pub prefetched_at: DateTime<Utc>,
}

pub fn prefetch_key(id: &str) -> String {
    format!("prefetch:{}", id)
}

pub fn cover_key(id: &str) -> String {
    format!("cover:{}", id)
}

/// Reads `prefetch:{id}` records from the shared cache store.
pub struct CacheWarmSource {
    store: Arc<CacheStore>,
}

impl CacheWarmSource {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }
}

impl WarmCache for CacheWarmSource {
    fn prefetched_metadata<'a>(
        &'a self,
        cache_key: &'a str,
    ) -> BoxFuture<'a, Option<DocumentMetadata>> {
        Box::pin(async move {
            let record: PrefetchRecord = self.store.get_json(&prefetch_key(cache_key)).await?;
            record.document
        })
    }
}

/// A book to warm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRef {
    pub id: String,
    pub book_url: Option<String>,
    pub cover_url: Option<String>,
}

/// Outcome of a prefetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchSummary {
    pub attempted: usize,
    pub covers_cached: usize,
    pub covers_already_cached: usize,
    pub failed: usize,
}

/// Warms covers and file info for popular books.
pub struct CoverPrefetcher {
    store: Arc<CacheStore>,
    transport: Arc<dyn HttpTransport>,
    max_books: usize,
}

impl CoverPrefetcher {
    pub fn new(store: Arc<CacheStore>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            store,
            transport,
            max_books: DEFAULT_POPULAR_BOOKS,
        }
    }

    pub fn with_max_books(mut self, max_books: usize) -> Self {
        self.max_books = max_books;
        self
    }

    /// Warm the first `max_books` of `books` concurrently. Failures are
    /// counted and logged, never returned.
    pub async fn prefetch_covers(&self, books: &[BookRef]) -> PrefetchSummary {
        let selected = &books[..books.len().min(self.max_books)];
        let outcomes = join_all(selected.iter().map(|book| self.prefetch_one(book))).await;

        let mut summary = PrefetchSummary {
            attempted: selected.len(),
            ..PrefetchSummary::default()
        };
        for outcome in outcomes {
            match outcome {
                CoverOutcome::Cached => summary.covers_cached += 1,
                CoverOutcome::AlreadyCached => summary.covers_already_cached += 1,
                CoverOutcome::Skipped => {}
                CoverOutcome::Failed => summary.failed += 1,
            }
        }

        info!(
            attempted = summary.attempted,
            cached = summary.covers_cached,
            already_cached = summary.covers_already_cached,
            failed = summary.failed,
            "Cover prefetch complete"
        );
        summary
    }

    /// Store a prefetch record carrying already-extracted metadata.
    pub async fn record_prefetch(&self, id: &str, document: DocumentMetadata) {
        let record = PrefetchRecord {
            id: id.to_string(),
            file: None,
            document: Some(document),
            cover_cached: self.store.contains(&cover_key(id)).await,
            prefetched_at: self.store.clock().now(),
        };
        if let Err(e) = self
            .store
            .set_json(&prefetch_key(id), &record, EntryType::Metadata)
            .await
        {
            warn!(id, error = %e, "Failed to store prefetch record");
        }
    }

    async fn prefetch_one(&self, book: &BookRef) -> CoverOutcome {
        let file = match &book.book_url {
            Some(url) => self.head(url).await,
            None => None,
        };

        let outcome = match &book.cover_url {
            Some(url) => self.fetch_cover(&book.id, url).await,
            None => CoverOutcome::Skipped,
        };

        let previous: Option<PrefetchRecord> = self.store.get_json(&prefetch_key(&book.id)).await;
        let record = PrefetchRecord {
            id: book.id.clone(),
            file,
            document: previous.and_then(|p| p.document),
            cover_cached: matches!(outcome, CoverOutcome::Cached | CoverOutcome::AlreadyCached),
            prefetched_at: self.store.clock().now(),
        };
        if let Err(e) = self
            .store
            .set_json(&prefetch_key(&book.id), &record, EntryType::Metadata)
            .await
        {
            warn!(id = %book.id, error = %e, "Failed to store prefetch record");
        }
        outcome
    }

    async fn head(&self, url: &str) -> Option<RemoteFileInfo> {
        match self.transport.send(HttpRequest::head(url), None).await {
            Ok(response) if response.is_success() => Some(RemoteFileInfo {
                content_length: response.content_length(),
                last_modified: response.header("last-modified").map(str::to_string),
                etag: response.header("etag").map(str::to_string),
                supports_ranges: response.accepts_byte_ranges(),
            }),
            Ok(response) => {
                debug!(url, status = response.status, "Book HEAD failed");
                None
            }
            Err(e) => {
                debug!(url, error = %e, "Book HEAD failed");
                None
            }
        }
    }

    async fn fetch_cover(&self, id: &str, url: &str) -> CoverOutcome {
        let key = cover_key(id);
        if self.store.contains(&key).await {
            return CoverOutcome::AlreadyCached;
        }

        let body: Result<Bytes, String> = match self.transport.send(HttpRequest::get(url), None).await {
            Ok(response) => ensure_success(response, url)
                .map(|r| r.body)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match body {
            Ok(body) => match self.store.set(&key, CacheValue::Bytes(body), EntryType::Cover).await {
                Ok(()) => CoverOutcome::Cached,
                Err(e) => {
                    warn!(id, error = %e, "Failed to cache cover");
                    CoverOutcome::Failed
                }
            },
            Err(e) => {
                warn!(id, url, error = %e, "Cover prefetch failed");
                CoverOutcome::Failed
            }
        }
    }
}

enum CoverOutcome {
    Cached,
    AlreadyCached,
    Skipped,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::epub::RawStructure;
    use crate::test_support::MockTransport;

    fn book(id: &str, cover: bool) -> BookRef {
        BookRef {
            id: id.to_string(),
            book_url: Some(format!("https://books.example/{}.epub", id)),
            cover_url: cover.then(|| format!("https://covers.example/{}.jpg", id)),
        }
    }

    #[tokio::test]
    async fn test_prefetch_covers_caches_and_counts() {
        let store = Arc::new(CacheStore::in_memory(CacheConfig::default()));
        let transport = MockTransport::new();
        transport.add_resource("https://covers.example/a.jpg", vec![1u8; 2048]);
        transport.add_resource("https://books.example/a.epub", vec![0u8; 10]);
        let prefetcher = CoverPrefetcher::new(Arc::clone(&store), Arc::new(transport.clone()));

        // "b" has a cover URL that 404s, "c" has none.
        let books = vec![book("a", true), book("b", true), book("c", false)];
        let summary = prefetcher.prefetch_covers(&books).await;
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.covers_cached, 1);
        assert_eq!(summary.failed, 1);

        let cover = store.entry_info("cover:a").await.unwrap();
        assert_eq!(cover.entry_type, EntryType::Cover);
        assert_eq!(cover.size_bytes, 2048);

        let record: PrefetchRecord = store.get_json("prefetch:a").await.unwrap();
        assert!(record.cover_cached);
        assert_eq!(record.file.unwrap().content_length, Some(10));

        let again = prefetcher.prefetch_covers(&books[..1]).await;
        assert_eq!(again.covers_already_cached, 1);
        assert_eq!(transport.fetch_count("https://covers.example/a.jpg"), 1);
    }

    #[tokio::test]
    async fn test_max_books_limits_the_run() {
        let store = Arc::new(CacheStore::in_memory(CacheConfig::default()));
        let prefetcher =
            CoverPrefetcher::new(store, Arc::new(MockTransport::new())).with_max_books(2);
        let books: Vec<_> = (0..5).map(|i| book(&i.to_string(), false)).collect();
        assert_eq!(prefetcher.prefetch_covers(&books).await.attempted, 2);
    }

    #[tokio::test]
    async fn test_warm_source_returns_recorded_metadata() {
        let store = Arc::new(CacheStore::in_memory(CacheConfig::default()));
        let prefetcher = CoverPrefetcher::new(Arc::clone(&store), Arc::new(MockTransport::new()));
        let source = CacheWarmSource::new(Arc::clone(&store));

        assert!(source.prefetched_metadata("emma").await.is_none());

        let document = RawStructure {
            title: Some("Emma".to_string()),
            ..RawStructure::default()
        }
        .normalize("emma", Utc::now());
        prefetcher.record_prefetch("emma", document.clone()).await;

        assert_eq!(source.prefetched_metadata("emma").await, Some(document));
    }
}
