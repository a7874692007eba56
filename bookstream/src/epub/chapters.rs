//! Chapter fetching with deduplication and reading-speed-adaptive prefetch.
//!
//! Every chapter request goes cache → in-flight fetch → new fetch. In-flight
//! fetches live in a per-session pending table as [`Shared`] futures, so any
//! number of concurrent callers for one href share a single network request.
//!
//! Background preloads (the initial window and position-driven prefetch) log
//! and swallow failures; only direct [`ChapterManager::get_chapter`] calls
//! return them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::future::{FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::metadata::DocumentMetadata;
use crate::cache::{BoxFuture, CacheStore, CacheValue, EntryType};
use crate::config::EpubConfig;
use crate::error::StreamingError;
use crate::telemetry::{metric, MetricsSink};

/// Fetches raw chapter bodies.
pub trait ChapterSource: Send + Sync {
    fn fetch_chapter<'a>(
        &'a self,
        book_url: &'a str,
        href: &'a str,
    ) -> BoxFuture<'a, Result<Bytes, StreamingError>>;
}

pub fn chapter_key(identifier: &str, href: &str) -> String {
    format!("chapter:{}:{}", identifier, href)
}

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, StreamingError>>>;

/// Result of a preload batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub requested: u32,
    pub loaded: u32,
    pub failed: u32,
}

struct State {
    preloaded: HashSet<String>,
    pending: HashMap<String, SharedFetch>,
    reading_speed_wpm: u32,
    distance: u32,
}

struct Inner {
    book_url: String,
    metadata: Arc<DocumentMetadata>,
    source: Arc<dyn ChapterSource>,
    store: Arc<CacheStore>,
    metrics: Arc<dyn MetricsSink>,
    config: EpubConfig,
    token: CancellationToken,
    state: Mutex<State>,
}

/// Per-session chapter queue. Clones share the same session.
#[derive(Clone)]
pub struct ChapterManager {
    inner: Arc<Inner>,
}

impl ChapterManager {
    pub fn new(
        book_url: impl Into<String>,
        metadata: Arc<DocumentMetadata>,
        source: Arc<dyn ChapterSource>,
        store: Arc<CacheStore>,
        metrics: Arc<dyn MetricsSink>,
        config: EpubConfig,
        token: CancellationToken,
    ) -> Self {
        let reading_speed_wpm = config.default_reading_speed_wpm;
        let distance = config.distance_for_speed(reading_speed_wpm);
        Self {
            inner: Arc::new(Inner {
                book_url: book_url.into(),
                metadata,
                source,
                store,
                metrics,
                config,
                token,
                state: Mutex::new(State {
                    preloaded: HashSet::new(),
                    pending: HashMap::new(),
                    reading_speed_wpm,
                    distance,
                }),
            }),
        }
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.inner.metadata
    }

    pub fn preload_distance(&self) -> u32 {
        self.inner.state.lock().distance
    }

    pub fn reading_speed(&self) -> u32 {
        self.inner.state.lock().reading_speed_wpm
    }

    /// Hrefs loaded during this session, in spine order.
    pub fn preloaded(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        self.inner
            .metadata
            .spine
            .iter()
            .filter(|item| state.preloaded.contains(&item.href))
            .map(|item| item.href.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Chapter body for `href`: cache, then any in-flight fetch, then a new one.
    pub async fn get_chapter(&self, href: &str) -> Result<Bytes, StreamingError> {
        if self.inner.token.is_cancelled() {
            return Err(StreamingError::aborted());
        }

        let key = chapter_key(&self.inner.metadata.identifier, href);
        if let Some(value) = self.inner.store.get(&key).await {
            if let Some(bytes) = value.into_bytes() {
                self.inner.state.lock().preloaded.insert(href.to_string());
                return Ok(bytes);
            }
        }

        let fetch = {
            let mut state = self.inner.state.lock();
            match state.pending.get(href) {
                Some(fetch) => {
                    debug!(href, "Joining in-flight chapter fetch");
                    fetch.clone()
                }
                None => {
                    let fetch = self.fetch(href.to_string(), key).boxed().shared();
                    state.pending.insert(href.to_string(), fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Fetch, cache and record one chapter. Holds only a weak session handle
    /// so the pending table never keeps the session alive.
    fn fetch(
        &self,
        href: String,
        key: String,
    ) -> impl std::future::Future<Output = Result<Bytes, StreamingError>> + Send + 'static {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let source = Arc::clone(&self.inner.source);
        let store = Arc::clone(&self.inner.store);
        let metrics = Arc::clone(&self.inner.metrics);
        let token = self.inner.token.clone();
        let book_url = self.inner.book_url.clone();

        async move {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(StreamingError::aborted()),
                result = source.fetch_chapter(&book_url, &href) => result,
            };

            if let Ok(body) = &result {
                metrics.record(metric::CHAPTER_FETCH_MS, started.elapsed().as_millis() as f64);
                // Aborted sessions never write.
                if !token.is_cancelled() {
                    if let Err(e) = store
                        .set(&key, CacheValue::Bytes(body.clone()), EntryType::Content)
                        .await
                    {
                        warn!(href = %href, error = %e, "Failed to cache chapter");
                    }
                }
                debug!(href = %href, bytes = body.len(), "Chapter fetched");
            }

            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                state.pending.remove(&href);
                if result.is_ok() {
                    state.preloaded.insert(href.clone());
                }
            }
            result
        }
    }

    async fn load_batch(
        &self,
        hrefs: Vec<String>,
        on_loaded: Option<&(dyn Fn(u32, u32) + Send + Sync)>,
    ) -> PreloadReport {
        let mut report = PreloadReport {
            requested: hrefs.len() as u32,
            ..PreloadReport::default()
        };

        let mut batch: FuturesUnordered<_> = hrefs
            .into_iter()
            .map(|href| async move {
                let result = self.get_chapter(&href).await;
                (href, result)
            })
            .collect();

        while let Some((href, result)) = batch.next().await {
            match result {
                Ok(_) => report.loaded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(href = %href, error = %e, "Chapter preload failed");
                }
            }
            if let Some(callback) = on_loaded {
                callback(report.loaded + report.failed, report.requested);
            }
        }
        report
    }

    /// Load the first `min(distance, spine_len)` chapters in parallel.
    ///
    /// `on_loaded` is called with `(done, total)` as each one settles.
    pub async fn preload_initial(
        &self,
        on_loaded: Option<&(dyn Fn(u32, u32) + Send + Sync)>,
    ) -> PreloadReport {
        let distance = self.preload_distance() as usize;
        let hrefs: Vec<String> = self
            .inner
            .metadata
            .spine
            .iter()
            .take(distance)
            .map(|item| item.href.clone())
            .collect();
        let report = self.load_batch(hrefs, on_loaded).await;
        debug!(
            loaded = report.loaded,
            failed = report.failed,
            "Initial chapter window loaded"
        );
        report
    }

    /// The reader moved to spine `index`. Adapts the prefetch distance to
    /// `reading_speed_wpm` when given and preloads the following chapters in
    /// the background.
    pub fn on_position_changed(
        &self,
        index: usize,
        reading_speed_wpm: Option<u32>,
    ) -> JoinHandle<PreloadReport> {
        let hrefs: Vec<String> = {
            let mut state = self.inner.state.lock();
            if let Some(speed) = reading_speed_wpm {
                state.reading_speed_wpm = speed;
                state.distance = self.inner.config.distance_for_speed(speed);
            }
            let distance = state.distance as usize;
            self.inner
                .metadata
                .spine
                .iter()
                .skip(index + 1)
                .take(distance)
                .filter(|item| {
                    !state.preloaded.contains(&item.href) && !state.pending.contains_key(&item.href)
                })
                .map(|item| item.href.clone())
                .collect()
        };

        debug!(index, targets = hrefs.len(), "Position changed");
        let manager = self.clone();
        tokio::spawn(async move {
            if hrefs.is_empty() || manager.inner.token.is_cancelled() {
                return PreloadReport::default();
            }
            manager.load_batch(hrefs, None).await
        })
    }

    /// Cancel in-flight work and drop session state.
    pub fn abort(&self) {
        self.inner.token.cancel();
        let mut state = self.inner.state.lock();
        state.pending.clear();
        state.preloaded.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::epub::metadata::{RawSpineItem, RawStructure};
    use crate::telemetry::NoopMetrics;
    use crate::test_support::RecordingMetrics;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts fetches per href and optionally stalls or fails them.
    #[derive(Default)]
    struct CountingSource {
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
        delay: Option<Duration>,
        failing: HashSet<String>,
    }

    impl CountingSource {
        fn calls(&self, href: &str) -> usize {
            self.calls.lock().get(href).copied().unwrap_or(0)
        }
    }

    impl ChapterSource for CountingSource {
        fn fetch_chapter<'a>(
            &'a self,
            _book_url: &'a str,
            href: &'a str,
        ) -> BoxFuture<'a, Result<Bytes, StreamingError>> {
            Box::pin(async move {
                *self.calls.lock().entry(href.to_string()).or_default() += 1;
                self.total.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.failing.contains(href) {
                    return Err(StreamingError::network(format!("HTTP 500 for {}", href)));
                }
                Ok(Bytes::from(format!("<p>{}</p>", href)))
            })
        }
    }

    fn metadata(chapters: usize) -> Arc<DocumentMetadata> {
        Arc::new(
            RawStructure {
                identifier: Some("urn:test".to_string()),
                spine: (0..chapters)
                    .map(|i| RawSpineItem {
                        href: format!("ch{}.xhtml", i),
                    })
                    .collect(),
                ..RawStructure::default()
            }
            .normalize("test", Utc::now()),
        )
    }

    fn manager(source: Arc<CountingSource>, chapters: usize) -> (ChapterManager, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::in_memory(CacheConfig::default()));
        let manager = ChapterManager::new(
            "https://books.example/test",
            metadata(chapters),
            source,
            Arc::clone(&store),
            Arc::new(NoopMetrics),
            EpubConfig::default(),
            CancellationToken::new(),
        );
        (manager, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_fetch() {
        let source = Arc::new(CountingSource {
            delay: Some(Duration::from_millis(100)),
            ..CountingSource::default()
        });
        let (manager, _) = manager(Arc::clone(&source), 5);

        let (a, b) = tokio::join!(
            manager.get_chapter("ch1.xhtml"),
            manager.get_chapter("ch1.xhtml")
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.calls("ch1.xhtml"), 1);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let source = Arc::new(CountingSource::default());
        let (manager, store) = manager(Arc::clone(&source), 5);

        manager.get_chapter("ch0.xhtml").await.unwrap();
        manager.get_chapter("ch0.xhtml").await.unwrap();

        assert_eq!(source.calls("ch0.xhtml"), 1);
        let record = store.entry_info("chapter:urn:test:ch0.xhtml").await.unwrap();
        assert_eq!(record.entry_type, EntryType::Content);
    }

    #[tokio::test]
    async fn test_preload_initial_loads_window() {
        let source = Arc::new(CountingSource::default());
        let (manager, _) = manager(Arc::clone(&source), 20);

        let report = manager.preload_initial(None).await;
        assert_eq!(report, PreloadReport { requested: 3, loaded: 3, failed: 0 });
        assert_eq!(manager.preloaded(), vec!["ch0.xhtml", "ch1.xhtml", "ch2.xhtml"]);
    }

    #[tokio::test]
    async fn test_preload_initial_is_capped_by_spine_length() {
        let source = Arc::new(CountingSource::default());
        let (manager, _) = manager(source, 2);
        assert_eq!(manager.preload_initial(None).await.requested, 2);
    }

    #[tokio::test]
    async fn test_fast_reader_extends_prefetch_window() {
        let source = Arc::new(CountingSource::default());
        let (manager, _) = manager(Arc::clone(&source), 20);
        manager.preload_initial(None).await;

        let report = manager.on_position_changed(2, Some(350)).await.unwrap();
        assert_eq!(report.loaded, 5);
        assert_eq!(manager.preload_distance(), 5);

        let expected: Vec<String> = (0..=7).map(|i| format!("ch{}.xhtml", i)).collect();
        assert_eq!(manager.preloaded(), expected);
        assert_eq!(source.total.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_position_change_skips_loaded_chapters() {
        let source = Arc::new(CountingSource::default());
        let (manager, _) = manager(Arc::clone(&source), 10);
        manager.preload_initial(None).await;

        let report = manager.on_position_changed(0, None).await.unwrap();
        // ch1..ch3 wanted, ch1 and ch2 already loaded.
        assert_eq!(report.requested, 1);
        assert_eq!(source.calls("ch1.xhtml"), 1);
    }

    #[tokio::test]
    async fn test_preload_failures_are_swallowed_but_direct_failures_propagate() {
        let source = Arc::new(CountingSource {
            failing: ["ch1.xhtml".to_string()].into_iter().collect(),
            ..CountingSource::default()
        });
        let (manager, _) = manager(Arc::clone(&source), 5);

        let report = manager.preload_initial(None).await;
        assert_eq!(report.loaded, 2);
        assert_eq!(report.failed, 1);
        assert!(manager.get_chapter("ch1.xhtml").await.is_err());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_and_never_writes() {
        let source = Arc::new(CountingSource {
            delay: Some(Duration::from_secs(5)),
            ..CountingSource::default()
        });
        let (manager, store) = manager(Arc::clone(&source), 5);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_chapter("ch0.xhtml").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.abort();

        let err = pending.await.unwrap().unwrap_err();
        assert!(!err.recoverable);
        assert_eq!(store.stats().await.entry_count, 0);
        assert!(manager.get_chapter("ch0.xhtml").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_time_is_reported() {
        let metrics = RecordingMetrics::default();
        let store = Arc::new(CacheStore::in_memory(CacheConfig::default()));
        let manager = ChapterManager::new(
            "https://books.example/test",
            metadata(3),
            Arc::new(CountingSource::default()),
            store,
            Arc::new(metrics.clone()),
            EpubConfig::default(),
            CancellationToken::new(),
        );
        manager.get_chapter("ch0.xhtml").await.unwrap();
        assert_eq!(metrics.count(metric::CHAPTER_FETCH_MS), 1);
    }
}
