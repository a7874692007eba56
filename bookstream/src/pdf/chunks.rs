//! Chunked range reads with per-chunk caching and deduplication.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use futures::future::{try_join_all, FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::engine::RangeReader;
use crate::cache::{BoxFuture, CacheStore, CacheValue, EntryType};
use crate::error::StreamingError;
use crate::network::{ChunkPlanner, HttpRequest, HttpTransport};
use crate::telemetry::{metric, MetricsSink};

pub fn chunk_key(cache_key: &str, index: u64) -> String {
    format!("pdf-chunk:{}:{}", cache_key, index)
}

type SharedChunk = Shared<BoxFuture<'static, Result<Bytes, StreamingError>>>;

struct Inner {
    url: String,
    cache_key: String,
    chunk_bytes: u64,
    total_bytes: u64,
    transport: Arc<dyn HttpTransport>,
    store: Arc<CacheStore>,
    metrics: Arc<dyn MetricsSink>,
    token: CancellationToken,
    pending: Mutex<HashMap<u64, SharedChunk>>,
    loaded: Mutex<BTreeSet<u64>>,
}

/// Reads a remote file in fixed-size chunks.
///
/// Each chunk is fetched at most once at a time, cached under
/// `pdf-chunk:{key}:{index}`, and served from the cache afterwards.
#[derive(Clone)]
pub struct ChunkReader {
    inner: Arc<Inner>,
}

impl ChunkReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: impl Into<String>,
        cache_key: impl Into<String>,
        chunk_bytes: u64,
        total_bytes: u64,
        transport: Arc<dyn HttpTransport>,
        store: Arc<CacheStore>,
        metrics: Arc<dyn MetricsSink>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                cache_key: cache_key.into(),
                chunk_bytes,
                total_bytes,
                transport,
                store,
                metrics,
                token,
                pending: Mutex::new(HashMap::new()),
                loaded: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.inner.chunk_bytes
    }

    pub fn chunk_count(&self) -> u64 {
        ChunkPlanner::chunk_count(self.inner.total_bytes, self.inner.chunk_bytes)
    }

    /// Indices of chunks available to this session.
    pub fn loaded_chunks(&self) -> Vec<u64> {
        self.inner.loaded.lock().iter().copied().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Forget in-flight fetches and loaded indices.
    pub fn clear(&self) {
        self.inner.pending.lock().clear();
        self.inner.loaded.lock().clear();
    }

    pub async fn read_chunk(&self, index: u64) -> Result<Bytes, StreamingError> {
        if self.inner.token.is_cancelled() {
            return Err(StreamingError::aborted());
        }

        let key = chunk_key(&self.inner.cache_key, index);
        let expected =
            ChunkPlanner::chunk_range(index, self.inner.chunk_bytes, self.inner.total_bytes)
                .map(|range| range.len());
        if let Some(bytes) = self.inner.store.get(&key).await.and_then(|v| v.into_bytes()) {
            // A chunk cached under another layout is refetched.
            if Some(bytes.len() as u64) == expected {
                self.inner.loaded.lock().insert(index);
                return Ok(bytes);
            }
            debug!(index, cached = bytes.len(), ?expected, "Cached chunk has a stale layout");
        }

        let fetch = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&index) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.fetch(index, key).boxed().shared();
                    pending.insert(index, fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    fn fetch(
        &self,
        index: u64,
        key: String,
    ) -> impl std::future::Future<Output = Result<Bytes, StreamingError>> + Send + 'static {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        let store = Arc::clone(&self.inner.store);
        let metrics = Arc::clone(&self.inner.metrics);
        let token = self.inner.token.clone();
        let url = self.inner.url.clone();
        let range = ChunkPlanner::chunk_range(index, self.inner.chunk_bytes, self.inner.total_bytes);

        async move {
            let result = async {
                let range = range.ok_or_else(|| {
                    StreamingError::streaming(format!("chunk {} is past the end of {}", index, url))
                        .with_recoverable(false)
                })?;

                let request = HttpRequest::get(url.as_str()).with_range(range);
                let response = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(StreamingError::aborted()),
                    response = transport.send(request, None) => response?,
                };

                match response.status {
                    206 => {}
                    200 => {
                        return Err(StreamingError::range_not_supported(format!(
                            "server ignored range request for {}",
                            url
                        )))
                    }
                    status => {
                        return Err(StreamingError::network(format!(
                            "HTTP {} fetching chunk {} of {}",
                            status, index, url
                        )))
                    }
                }

                if response.body.len() as u64 != range.len() {
                    return Err(StreamingError::network(format!(
                        "short chunk {}: expected {} bytes, got {}",
                        index,
                        range.len(),
                        response.body.len()
                    )));
                }
                Ok(response.body)
            }
            .await;

            if let Ok(body) = &result {
                metrics.record(metric::PDF_CHUNK_BYTES, body.len() as f64);
                if !token.is_cancelled() {
                    if let Err(e) = store
                        .set(&key, CacheValue::Bytes(body.clone()), EntryType::Content)
                        .await
                    {
                        warn!(index, error = %e, "Failed to cache chunk");
                    }
                }
                debug!(index, bytes = body.len(), "Chunk fetched");
            }

            if let Some(inner) = weak.upgrade() {
                inner.pending.lock().remove(&index);
                if result.is_ok() {
                    inner.loaded.lock().insert(index);
                }
            }
            result
        }
    }

    async fn read(&self, start: u64, end: u64) -> Result<Bytes, StreamingError> {
        let total = self.inner.total_bytes;
        if total == 0 || start > end || end >= total {
            return Err(StreamingError::streaming(format!(
                "range {}-{} outside document of {} bytes",
                start, end, total
            ))
            .with_recoverable(false));
        }

        let chunk = self.inner.chunk_bytes;
        let first = start / chunk;
        let last = end / chunk;
        let chunks = try_join_all((first..=last).map(|i| self.read_chunk(i))).await?;

        let offset = (start - first * chunk) as usize;
        let len = (end - start + 1) as usize;
        let available: usize = chunks.iter().map(Bytes::len).sum();
        if offset + len > available {
            return Err(StreamingError::streaming(format!(
                "chunks {}-{} hold {} bytes, range {}-{} needs {}",
                first,
                last,
                available,
                start,
                end,
                offset + len
            ))
            .with_recoverable(false));
        }
        if chunks.len() == 1 {
            return Ok(chunks[0].slice(offset..offset + len));
        }

        let mut joined = BytesMut::with_capacity(available);
        for part in &chunks {
            joined.extend_from_slice(part);
        }
        Ok(joined.freeze().slice(offset..offset + len))
    }

    /// The whole file, chunk by chunk.
    pub async fn read_all(&self) -> Result<Bytes, StreamingError> {
        self.read(0, self.inner.total_bytes.saturating_sub(1)).await
    }
}

impl RangeReader for ChunkReader {
    fn total_bytes(&self) -> u64 {
        self.inner.total_bytes
    }

    fn read_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, StreamingError>> {
        Box::pin(self.read(start, end))
    }
}
