//! Document loader facade.
//!
//! [`DocumentLoader`] is the single entry point applications use. It owns
//! the shared collaborators (cache store, transport, engine) and a registry
//! of open sessions, and routes each handle to the EPUB or PDF machinery.
//!
//! # Example
//!
//! ```ignore
//! let loader = LoaderBuilder::new(store).build()?;
//! let (handle, events) = loader.open_document(url, "emma", None)?;
//! let handle = events.wait().await?;
//! let body = loader.get_chapter(handle, "ch1.xhtml").await?;
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::BookstreamConfig;
use crate::epub::{
    ChapterManager, ChapterSource, DocumentMetadata, HttpChapterSource, ManifestStructureReader,
    MetadataExtractor, PreloadReport, StructureReader,
};
use crate::error::StreamingError;
use crate::network::{
    ConnectionProbe, HttpTransport, NetworkQuality, NoQualitySignal, ReqwestTransport,
    TransportError,
};
use crate::pdf::{BasicPdfEngine, PageInfo, PdfEngine, PdfInfo, RangeLoader};
use crate::streaming::{
    load_channel, LoadStream, ProgressReporter, Stage, StreamingOrchestrator, StreamingProgress,
    EPUB_STAGES, PDF_STAGES,
};
use crate::telemetry::{metric, MetricsSink, NoopMetrics};
use crate::warm::{NoWarmCache, WarmCache};

/// Document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Epub,
    Pdf,
}

impl DocumentKind {
    /// Guess the format from the URL's extension, ignoring query and fragment.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let path = path.trim_end_matches('/').to_ascii_lowercase();
        if path.ends_with(".pdf") {
            Some(DocumentKind::Pdf)
        } else if path.ends_with(".epub") {
            Some(DocumentKind::Epub)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Epub => "epub",
            DocumentKind::Pdf => "pdf",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epub" => Ok(DocumentKind::Epub),
            "pdf" => Ok(DocumentKind::Pdf),
            other => Err(format!("unknown document kind: {}", other)),
        }
    }
}

/// Opaque reference to an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle {
    id: u64,
    kind: DocumentKind,
}

impl DocumentHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }
}

impl fmt::Display for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Errors from the loader facade.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("unknown document handle {0}")]
    UnknownHandle(DocumentHandle),

    #[error("{handle} is not a {expected} document")]
    WrongKind {
        handle: DocumentHandle,
        expected: DocumentKind,
    },

    #[error("{0} has not finished loading")]
    NotReady(DocumentHandle),

    #[error("cannot tell the document format of {0}")]
    UnknownKind(String),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Streaming(#[from] StreamingError),
}

/// Background prefetch started by [`DocumentLoader::report_position`].
pub enum PrefetchTask {
    Chapters(JoinHandle<PreloadReport>),
    Pages(JoinHandle<u32>),
}

impl PrefetchTask {
    /// Wait for the prefetch and return how many items it loaded.
    pub async fn wait(self) -> u32 {
        match self {
            PrefetchTask::Chapters(task) => task.await.map(|r| r.loaded).unwrap_or_default(),
            PrefetchTask::Pages(task) => task.await.unwrap_or_default(),
        }
    }
}

struct EpubSession {
    token: CancellationToken,
    manager: Arc<Mutex<Option<ChapterManager>>>,
}

struct PdfSession {
    token: CancellationToken,
    loader: RangeLoader,
}

enum Session {
    Epub(EpubSession),
    Pdf(PdfSession),
}

impl Session {
    fn abort(&self) {
        match self {
            Session::Epub(session) => {
                session.token.cancel();
                if let Some(manager) = session.manager.lock().take() {
                    manager.abort();
                }
            }
            Session::Pdf(session) => {
                session.token.cancel();
                session.loader.abort();
            }
        }
    }
}

struct Inner {
    config: BookstreamConfig,
    store: Arc<CacheStore>,
    transport: Arc<dyn HttpTransport>,
    structure_reader: Arc<dyn StructureReader>,
    chapter_source: Arc<dyn ChapterSource>,
    warm: Arc<dyn WarmCache>,
    engine: Arc<dyn PdfEngine>,
    quality: Arc<dyn NetworkQuality>,
    metrics: Arc<dyn MetricsSink>,
    orchestrator: StreamingOrchestrator,
    sessions: DashMap<DocumentHandle, Session>,
    next_id: AtomicU64,
}

/// Opens documents and serves their content. Cheap to clone.
#[derive(Clone)]
pub struct DocumentLoader {
    inner: Arc<Inner>,
}

/// Builder for [`DocumentLoader`].
///
/// Only the cache store is required. The transport defaults to reqwest, the
/// EPUB collaborators to the exploded-manifest readers over that transport,
/// and the engine to [`BasicPdfEngine`].
pub struct LoaderBuilder {
    store: Arc<CacheStore>,
    config: BookstreamConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    structure_reader: Option<Arc<dyn StructureReader>>,
    chapter_source: Option<Arc<dyn ChapterSource>>,
    warm: Arc<dyn WarmCache>,
    engine: Arc<dyn PdfEngine>,
    quality: Arc<dyn NetworkQuality>,
    metrics: Arc<dyn MetricsSink>,
}

impl LoaderBuilder {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            config: BookstreamConfig::default(),
            transport: None,
            structure_reader: None,
            chapter_source: None,
            warm: Arc::new(NoWarmCache),
            engine: Arc::new(BasicPdfEngine),
            quality: Arc::new(NoQualitySignal),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn config(mut self, config: BookstreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn structure_reader(mut self, reader: Arc<dyn StructureReader>) -> Self {
        self.structure_reader = Some(reader);
        self
    }

    pub fn chapter_source(mut self, source: Arc<dyn ChapterSource>) -> Self {
        self.chapter_source = Some(source);
        self
    }

    pub fn warm_cache(mut self, warm: Arc<dyn WarmCache>) -> Self {
        self.warm = warm;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn PdfEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn network_quality(mut self, quality: Arc<dyn NetworkQuality>) -> Self {
        self.quality = quality;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<DocumentLoader, LoaderError> {
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config.transport)?),
        };
        let structure_reader = self
            .structure_reader
            .unwrap_or_else(|| Arc::new(ManifestStructureReader::new(Arc::clone(&transport))));
        let chapter_source = self
            .chapter_source
            .unwrap_or_else(|| Arc::new(HttpChapterSource::new(Arc::clone(&transport))));
        let orchestrator = StreamingOrchestrator::new(self.config.retry.policy());

        Ok(DocumentLoader {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                transport,
                structure_reader,
                chapter_source,
                warm: self.warm,
                engine: self.engine,
                quality: self.quality,
                metrics: self.metrics,
                orchestrator,
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        })
    }
}

impl DocumentLoader {
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &BookstreamConfig {
        &self.inner.config
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Start loading `url`.
    ///
    /// Returns the session handle at once together with the session's event
    /// stream, which yields progress updates and ends with `Ready(handle)` or
    /// `Failed(error)`. `kind` overrides detection from the URL extension.
    /// A failed session is closed; its handle becomes unknown.
    pub fn open_document(
        &self,
        url: &str,
        cache_key: &str,
        kind: Option<DocumentKind>,
    ) -> Result<(DocumentHandle, LoadStream<DocumentHandle>), LoaderError> {
        let kind = kind
            .or_else(|| DocumentKind::from_url(url))
            .ok_or_else(|| LoaderError::UnknownKind(url.to_string()))?;
        let handle = DocumentHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        info!(handle = %handle, url, cache_key, "Opening document");

        let stream = match kind {
            DocumentKind::Epub => self.open_epub(handle, url, cache_key),
            DocumentKind::Pdf => self.open_pdf(handle, url, cache_key),
        };
        Ok((handle, stream))
    }

    fn open_epub(&self, handle: DocumentHandle, url: &str, cache_key: &str) -> LoadStream<DocumentHandle> {
        let (reporter, completion, stream) = load_channel(EPUB_STAGES);
        let token = CancellationToken::new();
        let manager_slot = Arc::new(Mutex::new(None));
        self.inner.sessions.insert(
            handle,
            Session::Epub(EpubSession {
                token: token.clone(),
                manager: Arc::clone(&manager_slot),
            }),
        );

        let loader = self.clone();
        let url = url.to_string();
        let cache_key = cache_key.to_string();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = loader
                .inner
                .orchestrator
                .run(&reporter, &token, |_| {
                    loader.load_epub(&url, &cache_key, &reporter, &token, &manager_slot)
                })
                .await;

            match outcome {
                Ok(()) => {
                    loader
                        .inner
                        .metrics
                        .record(metric::EPUB_OPEN_MS, started.elapsed().as_millis() as f64);
                    completion.ready(handle);
                }
                Err(error) => {
                    warn!(handle = %handle, error = %error, "EPUB load failed");
                    loader.close(handle);
                    completion.fail(error);
                }
            }
        });
        stream
    }

    async fn load_epub(
        &self,
        url: &str,
        cache_key: &str,
        reporter: &ProgressReporter,
        token: &CancellationToken,
        slot: &Mutex<Option<ChapterManager>>,
    ) -> Result<(), StreamingError> {
        reporter.report(StreamingProgress::new(Stage::Metadata, 10.0, "Reading book details"));
        let extractor = MetadataExtractor::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.structure_reader),
            Arc::clone(&self.inner.warm),
            self.inner.config.epub.clone(),
        );
        let metadata = extractor.extract(url, cache_key).await?;
        let total = metadata.chapter_count() as u32;

        reporter.report(
            StreamingProgress::new(Stage::Structure, 30.0, "Building chapter list")
                .with_chapters(0, total),
        );
        let manager = ChapterManager::new(
            url,
            Arc::new(metadata),
            Arc::clone(&self.inner.chapter_source),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.metrics),
            self.inner.config.epub.clone(),
            token.child_token(),
        );

        reporter.report(
            StreamingProgress::new(Stage::Preloading, 40.0, "Loading first chapters")
                .with_chapters(0, total),
        );
        let on_loaded: &(dyn Fn(u32, u32) + Send + Sync) = &|done, window| {
            let fraction = if window == 0 { 1.0 } else { done as f32 / window as f32 };
            reporter.report(
                StreamingProgress::new(Stage::Preloading, 40.0 + 50.0 * fraction, "Loading first chapters")
                    .with_chapters(done, total),
            );
        };
        let report = manager.preload_initial(Some(on_loaded)).await;
        if token.is_cancelled() {
            return Err(StreamingError::aborted());
        }

        reporter.report(
            StreamingProgress::new(Stage::Streaming, 95.0, "Streaming remaining chapters")
                .with_chapters(report.loaded, total),
        );
        *slot.lock() = Some(manager);
        reporter.report(
            StreamingProgress::new(Stage::Ready, 100.0, "Ready").with_chapters(report.loaded, total),
        );
        Ok(())
    }

    fn open_pdf(&self, handle: DocumentHandle, url: &str, cache_key: &str) -> LoadStream<DocumentHandle> {
        let (reporter, completion, stream) = load_channel(PDF_STAGES);
        let token = CancellationToken::new();
        let range_loader = RangeLoader::new(
            url,
            cache_key,
            Arc::clone(&self.inner.transport),
            ConnectionProbe::new(Arc::clone(&self.inner.transport), Arc::clone(&self.inner.quality)),
            Arc::clone(&self.inner.engine),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.metrics),
            self.inner.config.pdf.clone(),
            token.child_token(),
        );
        self.inner.sessions.insert(
            handle,
            Session::Pdf(PdfSession {
                token: token.clone(),
                loader: range_loader.clone(),
            }),
        );

        let loader = self.clone();
        tokio::spawn(async move {
            let outcome = loader
                .inner
                .orchestrator
                .run(&reporter, &token, |_| range_loader.load_pdf(&reporter))
                .await;

            match outcome {
                Ok(_) => completion.ready(handle),
                Err(error) => {
                    warn!(handle = %handle, error = %error, "PDF load failed");
                    loader.close(handle);
                    completion.fail(error);
                }
            }
        });
        stream
    }

    fn close(&self, handle: DocumentHandle) {
        if let Some((_, session)) = self.inner.sessions.remove(&handle) {
            session.abort();
        }
    }

    fn chapters(&self, handle: DocumentHandle) -> Result<ChapterManager, LoaderError> {
        let session = self
            .inner
            .sessions
            .get(&handle)
            .ok_or(LoaderError::UnknownHandle(handle))?;
        let manager = match &*session {
            Session::Epub(epub) => epub.manager.lock().clone(),
            Session::Pdf(_) => {
                return Err(LoaderError::WrongKind {
                    handle,
                    expected: DocumentKind::Epub,
                })
            }
        };
        manager.ok_or(LoaderError::NotReady(handle))
    }

    fn range_loader(&self, handle: DocumentHandle) -> Result<RangeLoader, LoaderError> {
        let session = self
            .inner
            .sessions
            .get(&handle)
            .ok_or(LoaderError::UnknownHandle(handle))?;
        let loader = match &*session {
            Session::Pdf(pdf) => pdf.loader.clone(),
            Session::Epub(_) => {
                return Err(LoaderError::WrongKind {
                    handle,
                    expected: DocumentKind::Pdf,
                })
            }
        };
        Ok(loader)
    }

    /// Chapter body for `href`, from cache or the network.
    pub async fn get_chapter(&self, handle: DocumentHandle, href: &str) -> Result<Bytes, LoaderError> {
        let manager = self.chapters(handle)?;
        Ok(manager.get_chapter(href).await?)
    }

    /// Page `number` (1-based) of a PDF.
    pub async fn get_page(&self, handle: DocumentHandle, number: u32) -> Result<PageInfo, LoaderError> {
        let loader = self.range_loader(handle)?;
        if loader.info().is_none() {
            return Err(LoaderError::NotReady(handle));
        }
        Ok(loader.get_page(number).await?)
    }

    /// The reader is now at `position`: a spine index for EPUBs, a page
    /// number for PDFs. `reading_speed_wpm` adapts the EPUB prefetch
    /// distance and is ignored for PDFs.
    pub fn report_position(
        &self,
        handle: DocumentHandle,
        position: u32,
        reading_speed_wpm: Option<u32>,
    ) -> Result<PrefetchTask, LoaderError> {
        debug!(handle = %handle, position, reading_speed_wpm, "Position reported");
        match handle.kind {
            DocumentKind::Epub => {
                let manager = self.chapters(handle)?;
                Ok(PrefetchTask::Chapters(
                    manager.on_position_changed(position as usize, reading_speed_wpm),
                ))
            }
            DocumentKind::Pdf => {
                let loader = self.range_loader(handle)?;
                if loader.info().is_none() {
                    return Err(LoaderError::NotReady(handle));
                }
                Ok(PrefetchTask::Pages(loader.preload_after(position)))
            }
        }
    }

    /// Cancel the session and release its state. Returns whether the handle
    /// was open.
    pub fn abort(&self, handle: DocumentHandle) -> bool {
        match self.inner.sessions.remove(&handle) {
            Some((_, session)) => {
                session.abort();
                info!(handle = %handle, "Document closed");
                true
            }
            None => false,
        }
    }

    /// Metadata of an open EPUB.
    pub fn metadata(&self, handle: DocumentHandle) -> Result<DocumentMetadata, LoaderError> {
        Ok(self.chapters(handle)?.metadata().clone())
    }

    /// Hrefs of chapters loaded in an EPUB session, in spine order.
    pub fn preloaded_chapters(&self, handle: DocumentHandle) -> Result<Vec<String>, LoaderError> {
        Ok(self.chapters(handle)?.preloaded())
    }

    /// Summary of an open PDF.
    pub fn pdf_info(&self, handle: DocumentHandle) -> Result<PdfInfo, LoaderError> {
        self.range_loader(handle)?
            .info()
            .ok_or(LoaderError::NotReady(handle))
    }

    /// Chunk indices loaded in a PDF session.
    pub fn loaded_chunks(&self, handle: DocumentHandle) -> Result<Vec<u64>, LoaderError> {
        Ok(self.range_loader(handle)?.loaded_chunks())
    }

    /// Pages resolved in a PDF session.
    pub fn cached_pages(&self, handle: DocumentHandle) -> Result<Vec<u32>, LoaderError> {
        Ok(self.range_loader(handle)?.cached_pages())
    }
}
