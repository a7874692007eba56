//! Progressive PDF loading.
//!
//! ```text
//!  load_pdf
//!    │
//!    ├─ pdf:{key} cached? ──────────────────────────► open complete ─► ready
//!    │
//!    ├─ probe range support
//!    │     supported + size known
//!    │        └─ chunk 0 ─► open progressive ─► pdf-meta:{key} ─► ready
//!    │     otherwise / range_not_supported
//!    │        └─ full GET (10→60%) ─► pdf:{key} ─► open complete ─► ready
//! ```
//!
//! After the document is open, pages are resolved on demand. A page's bytes
//! come through the chunk reader, so repeated pages and overlapping windows
//! hit the per-chunk cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunks::ChunkReader;
use super::engine::{DocumentSource, EngineError, PageInfo, PdfDocument, PdfEngine};
use crate::cache::{CacheStore, CacheValue, EntryType};
use crate::config::PdfConfig;
use crate::error::{ErrorKind, StreamingError};
use crate::network::{
    ensure_success, ChunkPlanner, ConnectionProbe, HttpRequest, HttpTransport, RangeSupport,
};
use crate::streaming::{ProgressReporter, Stage, StreamingProgress};
use crate::telemetry::{metric, MetricsSink};

pub fn document_key(cache_key: &str) -> String {
    format!("pdf:{}", cache_key)
}

pub fn structure_key(cache_key: &str) -> String {
    format!("pdf-meta:{}", cache_key)
}

pub fn page_key(fingerprint: &str, number: u32) -> String {
    format!("page:{}:{}", fingerprint, number)
}

/// How the current document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Full body found in the cache.
    Cached,
    /// First chunk plus ranged reads.
    Progressive,
    /// One full download.
    Full,
}

/// Summary of an open document.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfInfo {
    pub page_count: u32,
    pub total_bytes: u64,
    pub fingerprint: String,
    pub mode: LoadMode,
    /// Chunk size of a progressive session.
    pub chunk_bytes: Option<u64>,
}

/// Persisted under `pdf-meta:{key}` by progressive sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfStructureRecord {
    pub page_count: u32,
    pub fingerprint: String,
    pub total_bytes: u64,
    pub chunk_bytes: u64,
}

#[derive(Default)]
struct LoaderState {
    document: Option<Arc<dyn PdfDocument>>,
    chunks: Option<ChunkReader>,
    pages: BTreeMap<u32, PageInfo>,
    info: Option<PdfInfo>,
}

struct Inner {
    url: String,
    cache_key: String,
    transport: Arc<dyn HttpTransport>,
    probe: ConnectionProbe,
    engine: Arc<dyn PdfEngine>,
    store: Arc<CacheStore>,
    metrics: Arc<dyn MetricsSink>,
    config: PdfConfig,
    token: CancellationToken,
    state: Mutex<LoaderState>,
}

/// Loads one PDF for one session and serves its pages.
///
/// Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct RangeLoader {
    inner: Arc<Inner>,
}

fn engine_error(error: EngineError) -> StreamingError {
    match error {
        EngineError::Source(e) => e,
        EngineError::Malformed(message) => StreamingError::parsing(message),
        e @ EngineError::NotLinearized => StreamingError::range_not_supported(e.to_string()),
        e @ EngineError::PageOutOfRange { .. } => {
            StreamingError::streaming(e.to_string()).with_recoverable(false)
        }
    }
}

fn not_loaded() -> StreamingError {
    StreamingError::streaming("document is not loaded").with_recoverable(false)
}

impl RangeLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: impl Into<String>,
        cache_key: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        probe: ConnectionProbe,
        engine: Arc<dyn PdfEngine>,
        store: Arc<CacheStore>,
        metrics: Arc<dyn MetricsSink>,
        config: PdfConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                cache_key: cache_key.into(),
                transport,
                probe,
                engine,
                store,
                metrics,
                config,
                token,
                state: Mutex::new(LoaderState::default()),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn info(&self) -> Option<PdfInfo> {
        self.inner.state.lock().info.clone()
    }

    /// Chunks fetched or read from cache in this session.
    pub fn loaded_chunks(&self) -> Vec<u64> {
        self.inner
            .state
            .lock()
            .chunks
            .as_ref()
            .map(ChunkReader::loaded_chunks)
            .unwrap_or_default()
    }

    /// Pages resolved in this session, ascending.
    pub fn cached_pages(&self) -> Vec<u32> {
        self.inner.state.lock().pages.keys().copied().collect()
    }

    /// Open the document, reporting `initializing → downloading →
    /// processing → ready`.
    ///
    /// The whole structure pass is bounded by the configured structure
    /// timeout. Each call starts from a clean session state, so the
    /// orchestrator can call it again on retry.
    pub async fn load_pdf(&self, reporter: &ProgressReporter) -> Result<PdfInfo, StreamingError> {
        let started = Instant::now();
        self.reset();

        let limit = self.inner.config.structure_timeout;
        let info = match tokio::time::timeout(limit, self.load_structure(reporter)).await {
            Ok(result) => result?,
            Err(_) => {
                self.reset();
                return Err(StreamingError::timeout(format!(
                    "loading document structure timed out after {}s",
                    limit.as_secs()
                )));
            }
        };

        self.inner
            .metrics
            .record(metric::PDF_OPEN_MS, started.elapsed().as_millis() as f64);
        info!(
            url = %self.inner.url,
            pages = info.page_count,
            mode = ?info.mode,
            "PDF ready"
        );
        Ok(info)
    }

    async fn load_structure(&self, reporter: &ProgressReporter) -> Result<PdfInfo, StreamingError> {
        reporter.report(StreamingProgress::new(Stage::Initializing, 5.0, "Preparing document"));

        if let Some(body) = self
            .inner
            .store
            .get(&document_key(&self.inner.cache_key))
            .await
            .and_then(CacheValue::into_bytes)
        {
            debug!(url = %self.inner.url, "Full document found in cache");
            let total = body.len() as u64;
            let info = self.open(DocumentSource::Complete(body), LoadMode::Cached, None).await?;
            reporter.report(
                StreamingProgress::new(Stage::Ready, 100.0, "Loaded from cache")
                    .with_bytes(total, Some(total))
                    .with_pages(info.page_count),
            );
            return Ok(info);
        }

        let support = match self.inner.probe.probe_range_support(&self.inner.url).await {
            Ok(support) => support,
            Err(e) => {
                warn!(url = %self.inner.url, error = %e, "Range probe failed, downloading in full");
                RangeSupport {
                    supported: false,
                    total_bytes: None,
                }
            }
        };

        let info = match support {
            RangeSupport {
                supported: true,
                total_bytes: Some(total),
            } => match self.load_progressive(total, reporter).await {
                Err(e) if e.kind == ErrorKind::RangeNotSupported => {
                    warn!(url = %self.inner.url, error = %e, "Cannot open progressively, downloading in full");
                    self.reset();
                    self.load_full(reporter).await?
                }
                other => other?,
            },
            _ => self.load_full(reporter).await?,
        };

        reporter.report(
            StreamingProgress::new(Stage::Ready, 100.0, "Document ready")
                .with_bytes(info.total_bytes, Some(info.total_bytes))
                .with_pages(info.page_count),
        );
        Ok(info)
    }

    async fn load_progressive(
        &self,
        total: u64,
        reporter: &ProgressReporter,
    ) -> Result<PdfInfo, StreamingError> {
        let chunk_bytes = self.planned_chunk_bytes(total).await;
        reporter.report(
            StreamingProgress::new(Stage::Downloading, 10.0, "Fetching document structure")
                .with_bytes(0, Some(total)),
        );

        let reader = ChunkReader::new(
            self.inner.url.as_str(),
            self.inner.cache_key.as_str(),
            chunk_bytes,
            total,
            Arc::clone(&self.inner.transport),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.metrics),
            self.inner.token.child_token(),
        );
        self.inner.state.lock().chunks = Some(reader.clone());

        let initial = reader.read_chunk(0).await?;
        reporter.report(
            StreamingProgress::new(Stage::Processing, 25.0, "Opening document")
                .with_bytes(initial.len() as u64, Some(total)),
        );

        let source = DocumentSource::Progressive {
            initial,
            total_bytes: total,
            reader: Arc::new(reader),
        };
        let info = self
            .open(source, LoadMode::Progressive, Some(chunk_bytes))
            .await?;

        let record = PdfStructureRecord {
            page_count: info.page_count,
            fingerprint: info.fingerprint.clone(),
            total_bytes: total,
            chunk_bytes,
        };
        if !self.inner.token.is_cancelled() {
            if let Err(e) = self
                .inner
                .store
                .set_json(&structure_key(&self.inner.cache_key), &record, EntryType::Metadata)
                .await
            {
                warn!(error = %e, "Failed to cache document structure");
            }
        }
        Ok(info)
    }

    /// Chunk size for this session. A previous session's size is reused
    /// when the file is unchanged, so its cached chunks line up.
    async fn planned_chunk_bytes(&self, total: u64) -> u64 {
        let key = structure_key(&self.inner.cache_key);
        match self.inner.store.get_json::<PdfStructureRecord>(&key).await {
            Some(record) if record.total_bytes == total && record.chunk_bytes > 0 => {
                debug!(chunk_bytes = record.chunk_bytes, "Reusing cached chunk layout");
                record.chunk_bytes
            }
            _ => ChunkPlanner::plan(total, self.inner.probe.classify()),
        }
    }

    async fn load_full(&self, reporter: &ProgressReporter) -> Result<PdfInfo, StreamingError> {
        reporter.report(StreamingProgress::new(Stage::Downloading, 10.0, "Downloading document"));

        let progress_reporter = reporter.clone();
        let on_progress = move |received: u64, total: Option<u64>| {
            if let Some(total) = total.filter(|&t| t > 0) {
                let fraction = (received as f32 / total as f32).min(1.0);
                progress_reporter.report(
                    StreamingProgress::new(Stage::Downloading, 10.0 + 50.0 * fraction, "Downloading document")
                        .with_bytes(received, Some(total)),
                );
            }
        };

        let request = HttpRequest::get(self.inner.url.as_str());
        let response = tokio::select! {
            biased;
            _ = self.inner.token.cancelled() => return Err(StreamingError::aborted()),
            response = self.inner.transport.send(request, Some(&on_progress)) => response?,
        };
        let body: Bytes = ensure_success(response, &self.inner.url)?.body;
        let total = body.len() as u64;

        reporter.report(
            StreamingProgress::new(Stage::Processing, 60.0, "Opening document")
                .with_bytes(total, Some(total)),
        );

        if !self.inner.token.is_cancelled() {
            if let Err(e) = self
                .inner
                .store
                .set(
                    &document_key(&self.inner.cache_key),
                    CacheValue::Bytes(body.clone()),
                    EntryType::Content,
                )
                .await
            {
                warn!(error = %e, "Failed to cache document body");
            }
        }

        self.open(DocumentSource::Complete(body), LoadMode::Full, None).await
    }

    async fn open(
        &self,
        source: DocumentSource,
        mode: LoadMode,
        chunk_bytes: Option<u64>,
    ) -> Result<PdfInfo, StreamingError> {
        let document = self.inner.engine.open(source).await.map_err(engine_error)?;
        if self.inner.token.is_cancelled() {
            return Err(StreamingError::aborted());
        }

        let info = PdfInfo {
            page_count: document.page_count(),
            total_bytes: document.total_bytes(),
            fingerprint: document.fingerprint().to_string(),
            mode,
            chunk_bytes,
        };
        let mut state = self.inner.state.lock();
        state.document = Some(document);
        state.info = Some(info.clone());
        Ok(info)
    }

    fn reset(&self) {
        let mut state = self.inner.state.lock();
        if let Some(chunks) = state.chunks.take() {
            chunks.clear();
        }
        state.document = None;
        state.pages.clear();
        state.info = None;
    }

    /// Page `number` (1-based): session map, then `page:{fingerprint}:{n}`,
    /// then the engine.
    pub async fn get_page(&self, number: u32) -> Result<PageInfo, StreamingError> {
        if self.inner.token.is_cancelled() {
            return Err(StreamingError::aborted());
        }

        let document = {
            let state = self.inner.state.lock();
            if let Some(page) = state.pages.get(&number) {
                return Ok(page.clone());
            }
            state.document.clone().ok_or_else(not_loaded)?
        };

        let key = page_key(document.fingerprint(), number);
        if let Some(page) = self.inner.store.get_json::<PageInfo>(&key).await {
            self.inner.state.lock().pages.insert(number, page.clone());
            return Ok(page);
        }

        let page = document.page(number).await.map_err(engine_error)?;
        if self.inner.token.is_cancelled() {
            return Err(StreamingError::aborted());
        }
        if let Err(e) = self.inner.store.set_json(&key, &page, EntryType::Content).await {
            warn!(page = number, error = %e, "Failed to cache page");
        }
        self.inner.state.lock().pages.insert(number, page.clone());
        Ok(page)
    }

    /// Best-effort [`get_page`](Self::get_page). Returns whether the page is
    /// now available.
    pub async fn preload_page(&self, number: u32) -> bool {
        match self.get_page(number).await {
            Ok(_) => true,
            Err(e) if self.inner.token.is_cancelled() => {
                debug!(page = number, error = %e, "Page preload cancelled");
                false
            }
            Err(e) => {
                warn!(page = number, error = %e, "Page preload failed");
                false
            }
        }
    }

    /// Preload the pages following `number` in the background.
    ///
    /// The task resolves to the number of pages preloaded.
    pub fn preload_after(&self, number: u32) -> JoinHandle<u32> {
        let loader = self.clone();
        let count = self
            .info()
            .map(|info| info.page_count)
            .unwrap_or_default();
        let last = number.saturating_add(self.inner.config.page_prefetch).min(count);

        tokio::spawn(async move {
            let mut loaded = 0;
            for page in number.saturating_add(1)..=last {
                if loader.inner.token.is_cancelled() {
                    break;
                }
                if loader.preload_page(page).await {
                    loaded += 1;
                }
            }
            loaded
        })
    }

    /// Cancel in-flight fetches and release the document and page map.
    pub fn abort(&self) {
        self.inner.token.cancel();
        self.reset();
        debug!(url = %self.inner.url, "PDF session aborted");
    }
}
