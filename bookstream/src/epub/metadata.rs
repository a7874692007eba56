//! Metadata-first structure pass for EPUB documents.
//!
//! Before any chapter content is fetched, the extractor produces a
//! [`DocumentMetadata`] (title, author, TOC, spine). Sources are tried in
//! order:
//!
//! 1. `epub-meta:{key}` in the cache, when younger than the freshness window
//! 2. the warm-cache service, when it prefetched this book
//! 3. the [`StructureReader`], bounded by the metadata timeout
//!
//! Whatever was produced is normalized and persisted before returning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{BoxFuture, CacheStore, Clock, EntryType};
use crate::config::EpubConfig;
use crate::error::StreamingError;
use crate::warm::WarmCache;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";
/// BCP 47 "undetermined".
pub const UNKNOWN_LANGUAGE: &str = "und";

/// A table-of-contents node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub label: String,
    pub href: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TocEntry>,
}

/// A spine item: one chapter in reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpineItem {
    pub href: String,
    pub index: u32,
}

/// Normalized bibliographic and structural data for one EPUB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub author: String,
    pub identifier: String,
    pub language: String,
    pub table_of_contents: Vec<TocEntry>,
    pub spine: Vec<SpineItem>,
    pub loaded_at: DateTime<Utc>,
}

impl DocumentMetadata {
    /// Whether this record is younger than `freshness` at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        match (now - self.loaded_at).to_std() {
            Ok(age) => age < freshness,
            // loaded_at in the future: clock skew, treat as fresh.
            Err(_) => true,
        }
    }

    pub fn chapter_count(&self) -> usize {
        self.spine.len()
    }

    pub fn href_at(&self, index: usize) -> Option<&str> {
        self.spine.get(index).map(|s| s.href.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawSpineItem {
    pub href: String,
}

/// Structure as a reader found it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawStructure {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "creator")]
    pub author: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "toc")]
    pub table_of_contents: Vec<TocEntry>,
    #[serde(default)]
    pub spine: Vec<RawSpineItem>,
}

impl RawStructure {
    /// Apply fallbacks and number the spine.
    pub fn normalize(self, cache_key: &str, loaded_at: DateTime<Utc>) -> DocumentMetadata {
        fn non_empty(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        DocumentMetadata {
            title: non_empty(self.title).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            author: non_empty(self.author).unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            identifier: non_empty(self.identifier).unwrap_or_else(|| cache_key.to_string()),
            language: non_empty(self.language).unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string()),
            table_of_contents: self.table_of_contents,
            spine: self
                .spine
                .into_iter()
                .enumerate()
                .map(|(index, item)| SpineItem {
                    href: item.href,
                    index: index as u32,
                })
                .collect(),
            loaded_at,
        }
    }
}

impl From<DocumentMetadata> for RawStructure {
    fn from(metadata: DocumentMetadata) -> Self {
        Self {
            title: Some(metadata.title),
            author: Some(metadata.author),
            identifier: Some(metadata.identifier),
            language: Some(metadata.language),
            table_of_contents: metadata.table_of_contents,
            spine: metadata
                .spine
                .into_iter()
                .map(|item| RawSpineItem { href: item.href })
                .collect(),
        }
    }
}

/// Reads the structure (package metadata, TOC, spine) of a book.
pub trait StructureReader: Send + Sync {
    fn read_structure<'a>(&'a self, url: &'a str)
        -> BoxFuture<'a, Result<RawStructure, StreamingError>>;
}

pub fn metadata_key(cache_key: &str) -> String {
    format!("epub-meta:{}", cache_key)
}

pub fn toc_key(cache_key: &str) -> String {
    format!("epub-toc:{}", cache_key)
}

pub struct MetadataExtractor {
    store: Arc<CacheStore>,
    reader: Arc<dyn StructureReader>,
    warm: Arc<dyn WarmCache>,
    config: EpubConfig,
    clock: Arc<dyn Clock>,
}

impl MetadataExtractor {
    pub fn new(
        store: Arc<CacheStore>,
        reader: Arc<dyn StructureReader>,
        warm: Arc<dyn WarmCache>,
        config: EpubConfig,
    ) -> Self {
        let clock = store.clock();
        Self {
            store,
            reader,
            warm,
            config,
            clock,
        }
    }

    pub async fn extract(
        &self,
        url: &str,
        cache_key: &str,
    ) -> Result<DocumentMetadata, StreamingError> {
        let key = metadata_key(cache_key);
        let now = self.clock.now();

        if let Some(cached) = self.store.get_json::<DocumentMetadata>(&key).await {
            if cached.is_fresh(now, self.config.metadata_freshness) {
                debug!(cache_key, "Metadata served from cache");
                return Ok(cached);
            }
            debug!(cache_key, loaded_at = %cached.loaded_at, "Cached metadata is stale");
        }

        let metadata = match self.warm.prefetched_metadata(cache_key).await {
            Some(prefetched) => {
                debug!(
                    cache_key,
                    prefetched_at = %prefetched.loaded_at,
                    "Metadata served from warm cache"
                );
                RawStructure::from(prefetched).normalize(cache_key, now)
            }
            None => {
                let raw = tokio::time::timeout(
                    self.config.metadata_timeout,
                    self.reader.read_structure(url),
                )
                .await
                .map_err(|_| {
                    StreamingError::metadata(format!(
                        "metadata extraction timed out after {}s",
                        self.config.metadata_timeout.as_secs()
                    ))
                })??;
                raw.normalize(cache_key, now)
            }
        };

        if let Err(e) = self
            .store
            .set_json(&key, &metadata, EntryType::Metadata)
            .await
        {
            warn!(cache_key, error = %e, "Failed to cache metadata");
        }
        if let Err(e) = self
            .store
            .set_json(&toc_key(cache_key), &metadata.table_of_contents, EntryType::Toc)
            .await
        {
            warn!(cache_key, error = %e, "Failed to cache table of contents");
        }

        info!(
            cache_key,
            title = %metadata.title,
            chapters = metadata.spine.len(),
            "Metadata extracted"
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::CacheConfig;
    use crate::error::ErrorKind;
    use crate::warm::NoWarmCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeReader {
        raw: RawStructure,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl FakeReader {
        fn new(raw: RawStructure) -> Self {
            Self {
                raw,
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl StructureReader for FakeReader {
        fn read_structure<'a>(
            &'a self,
            _url: &'a str,
        ) -> BoxFuture<'a, Result<RawStructure, StreamingError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(self.raw.clone())
            })
        }
    }

    fn raw_with_spine(n: usize) -> RawStructure {
        RawStructure {
            title: Some("Persuasion".to_string()),
            author: Some("Jane Austen".to_string()),
            identifier: Some("urn:isbn:9780141439686".to_string()),
            language: Some("en".to_string()),
            table_of_contents: Vec::new(),
            spine: (0..n)
                .map(|i| RawSpineItem {
                    href: format!("ch{}.xhtml", i),
                })
                .collect(),
        }
    }

    fn extractor(reader: Arc<FakeReader>, clock: ManualClock) -> MetadataExtractor {
        extractor_with_warm(reader, clock, Arc::new(NoWarmCache))
    }

    fn extractor_with_warm(
        reader: Arc<FakeReader>,
        clock: ManualClock,
        warm: Arc<dyn WarmCache>,
    ) -> MetadataExtractor {
        let store = Arc::new(CacheStore::in_memory_with_clock(
            CacheConfig::default(),
            Arc::new(clock),
        ));
        MetadataExtractor::new(store, reader, warm, EpubConfig::default())
    }

    struct FixedWarm {
        document: DocumentMetadata,
        calls: AtomicUsize,
    }

    impl WarmCache for FixedWarm {
        fn prefetched_metadata<'a>(
            &'a self,
            _cache_key: &'a str,
        ) -> BoxFuture<'a, Option<DocumentMetadata>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Some(self.document.clone())
            })
        }
    }

    #[test]
    fn test_normalize_applies_fallbacks() {
        let raw = RawStructure {
            title: Some("   ".to_string()),
            spine: vec![
                RawSpineItem { href: "a.xhtml".into() },
                RawSpineItem { href: "b.xhtml".into() },
            ],
            ..RawStructure::default()
        };
        let meta = raw.normalize("book-42", Utc::now());
        assert_eq!(meta.title, UNKNOWN_TITLE);
        assert_eq!(meta.author, UNKNOWN_AUTHOR);
        assert_eq!(meta.identifier, "book-42");
        assert_eq!(meta.language, UNKNOWN_LANGUAGE);
        assert_eq!(meta.spine[1], SpineItem { href: "b.xhtml".into(), index: 1 });
    }

    #[tokio::test]
    async fn test_extract_caches_and_reuses_fresh_metadata() {
        let reader = Arc::new(FakeReader::new(raw_with_spine(4)));
        let clock = ManualClock::default();
        let extractor = extractor(Arc::clone(&reader), clock.clone());

        let first = extractor.extract("https://books.example/p", "p").await.unwrap();
        clock.advance(Duration::from_secs(60 * 60));
        let second = extractor.extract("https://books.example/p", "p").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        assert!(extractor.store.entry_info("epub-meta:p").await.is_some());
        assert_eq!(
            extractor.store.entry_info("epub-toc:p").await.unwrap().entry_type,
            EntryType::Toc
        );
    }

    #[tokio::test]
    async fn test_stale_metadata_is_re_extracted() {
        let reader = Arc::new(FakeReader::new(raw_with_spine(2)));
        let clock = ManualClock::default();
        let extractor = extractor(Arc::clone(&reader), clock.clone());

        extractor.extract("https://books.example/p", "p").await.unwrap();
        clock.advance(Duration::from_secs(25 * 60 * 60));
        extractor.extract("https://books.example/p", "p").await.unwrap();

        assert_eq!(reader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reader_times_out_as_recoverable_metadata_error() {
        let mut reader = FakeReader::new(raw_with_spine(1));
        reader.delay = Some(Duration::from_secs(30));
        let extractor = extractor(Arc::new(reader), ManualClock::default());

        let err = extractor
            .extract("https://books.example/p", "p")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Metadata);
        assert!(err.recoverable);
    }

    #[tokio::test]
    async fn test_warm_metadata_is_normalized_and_restamped() {
        let clock = ManualClock::default();
        let prefetched_at = clock.now() - chrono::Duration::days(3);
        let mut document = raw_with_spine(3).normalize("p", prefetched_at);
        document.title = "  ".to_string();
        document.author = String::new();
        document.spine[2].index = 7;
        let warm = Arc::new(FixedWarm {
            document,
            calls: AtomicUsize::new(0),
        });
        let reader = Arc::new(FakeReader::new(raw_with_spine(1)));
        let extractor = extractor_with_warm(Arc::clone(&reader), clock.clone(), warm.clone());

        let first = extractor.extract("https://books.example/p", "p").await.unwrap();
        assert_eq!(first.title, UNKNOWN_TITLE);
        assert_eq!(first.author, UNKNOWN_AUTHOR);
        assert_eq!(first.spine[2].index, 2);
        assert_eq!(first.loaded_at, clock.now());

        clock.advance(Duration::from_secs(60 * 60));
        let second = extractor.extract("https://books.example/p", "p").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(warm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
    }
}
