//! The cache store: size accounting, lazy expiry and eviction over a backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, CacheError};
use super::clock::{Clock, SystemClock};
use super::disk::DiskBackend;
use super::entry::{CacheStats, CacheValue, EntryRecord, EntryType, GcResult};
use super::memory::MemoryBackend;
use crate::config::{CacheConfig, QuotaPolicy};
use crate::telemetry::{metric, MetricsSink, NoopMetrics};

/// Live index of records. Guarded by the store's single async mutex.
struct Index {
    records: HashMap<String, EntryRecord>,
    total_bytes: u64,
    last_cleanup_at: Option<DateTime<Utc>>,
}

impl Index {
    fn stats(&self) -> CacheStats {
        CacheStats {
            total_bytes: self.total_bytes,
            entry_count: self.records.len() as u32,
            last_cleanup_at: self.last_cleanup_at,
        }
    }
}

/// Hit, miss and eviction counts since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Persistent, size-bounded, type-aware cache shared by every loader session.
///
/// All operations take one async mutex, so lazy expiry and eviction are
/// atomic with respect to concurrent `get`/`set` calls.
pub struct CacheStore {
    index: Mutex<Index>,
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Open a store over `backend`, rebuilding totals from the persisted records.
    pub async fn open(
        backend: Arc<dyn CacheBackend>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        Self::open_with_clock(backend, config, Arc::new(SystemClock)).await
    }

    /// Open with an explicit time source.
    pub async fn open_with_clock(
        backend: Arc<dyn CacheBackend>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let state = backend.load().await?;

        let mut records = HashMap::with_capacity(state.records.len());
        let mut total_bytes = 0u64;
        for record in state.records {
            total_bytes += record.size_bytes;
            records.insert(record.key.clone(), record);
        }

        info!(
            backend = backend.name(),
            entries = records.len(),
            total_bytes,
            max_bytes = config.max_cache_bytes,
            "Cache store opened"
        );

        Ok(Self {
            index: Mutex::new(Index {
                records,
                total_bytes,
                last_cleanup_at: state.last_cleanup_at,
            }),
            backend,
            config,
            clock,
            metrics: Arc::new(NoopMetrics),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Store backed by a fresh [`MemoryBackend`].
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            index: Mutex::new(Index {
                records: HashMap::new(),
                total_bytes: 0,
                last_cleanup_at: None,
            }),
            backend: Arc::new(MemoryBackend::new()),
            config,
            clock,
            metrics: Arc::new(NoopMetrics),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Store persisted under `root` with a [`DiskBackend`].
    pub async fn open_disk(
        root: impl Into<std::path::PathBuf>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let backend = DiskBackend::open(root).await?;
        Self::open(Arc::new(backend), config).await
    }

    /// Report hits and misses to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Time source shared with collaborators that stamp their own records.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn is_expired(&self, record: &EntryRecord, now: DateTime<Utc>) -> bool {
        age(record.last_accessed_at, now) > self.config.max_entry_age
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(metric::CACHE_MISS, 1.0);
    }

    /// Look up `key`.
    ///
    /// A hit refreshes `last_accessed_at`. An expired entry is deleted and
    /// reported as a miss. Backend failures are logged and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let mut index = self.index.lock().await;
        let now = self.clock.now();

        let Some(record) = index.records.get(key).cloned() else {
            debug!(key, "Cache miss");
            self.record_miss();
            return None;
        };

        if self.is_expired(&record, now) {
            debug!(key, "Cache entry expired");
            if let Err(e) = self.remove_locked(&mut index, key).await {
                warn!(key, error = %e, "Failed to remove expired cache entry");
            }
            self.record_miss();
            return None;
        }

        let payload = match self.backend.read(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                warn!(key, "Cache record without payload, dropping it");
                if let Err(e) = self.remove_locked(&mut index, key).await {
                    warn!(key, error = %e, "Failed to drop dangling cache record");
                }
                self.record_miss();
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                self.record_miss();
                return None;
            }
        };

        let value = match CacheValue::decode(record.encoding, payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache payload undecodable, dropping it");
                if let Err(e) = self.remove_locked(&mut index, key).await {
                    warn!(key, error = %e, "Failed to drop undecodable cache entry");
                }
                self.record_miss();
                return None;
            }
        };

        let mut touched = record;
        touched.last_accessed_at = now;
        if let Err(e) = self.backend.touch(&touched).await {
            warn!(key, error = %e, "Failed to persist cache access time");
        }
        index.records.insert(key.to_string(), touched);

        debug!(key, "Cache hit");
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record(metric::CACHE_HIT, 1.0);
        Some(value)
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// Runs eviction first when the entry would push the total over quota.
    /// Under [`QuotaPolicy::Soft`] the entry is stored even if eviction could
    /// not make room; under [`QuotaPolicy::Hard`] it is rejected.
    pub async fn set(
        &self,
        key: &str,
        value: CacheValue,
        entry_type: EntryType,
    ) -> Result<(), CacheError> {
        let (encoding, payload) = value.encode()?;
        let size = payload.len() as u64;
        let max = self.config.max_cache_bytes;

        let mut index = self.index.lock().await;
        let now = self.clock.now();

        let previous = index.records.get(key).cloned();
        let previous_size = previous.as_ref().map(|r| r.size_bytes).unwrap_or(0);

        if self.config.quota == QuotaPolicy::Hard && size > max {
            return Err(CacheError::QuotaExceeded {
                needed: size,
                available: max.saturating_sub(index.total_bytes - previous_size),
                max,
            });
        }

        let projected = index.total_bytes - previous_size + size;
        if projected > max {
            let needed = projected - max;
            let result = self.evict_locked(&mut index, needed, Some(key), true).await;
            if result.entries_removed > 0 {
                debug!(key, needed, freed = result.bytes_freed, "Evicted to make room");
            }

            let projected = index.total_bytes - previous_size + size;
            if projected > max {
                match self.config.quota {
                    QuotaPolicy::Soft => warn!(
                        key,
                        size,
                        total_bytes = projected,
                        max_bytes = max,
                        "Cache quota exceeded, storing anyway"
                    ),
                    QuotaPolicy::Hard => {
                        return Err(CacheError::QuotaExceeded {
                            needed: size,
                            available: max.saturating_sub(index.total_bytes - previous_size),
                            max,
                        })
                    }
                }
            }
        }

        let record = EntryRecord {
            key: key.to_string(),
            entry_type,
            encoding,
            created_at: previous.map(|r| r.created_at).unwrap_or(now),
            last_accessed_at: now,
            size_bytes: size,
        };
        self.backend.write(&record, payload).await?;

        index.total_bytes = index.total_bytes - previous_size + size;
        index.records.insert(key.to_string(), record);
        debug!(key, size, entry_type = %entry_type, "Cache set");
        Ok(())
    }

    /// Serialize `value` as JSON and store it.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        entry_type: EntryType,
    ) -> Result<(), CacheError> {
        self.set(key, CacheValue::json(value)?, entry_type).await
    }

    /// Fetch and deserialize a JSON entry. A payload of the wrong shape is a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match value.to_json() {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key, error = %e, "Cached JSON has unexpected shape");
                None
            }
        }
    }

    /// Remove `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut index = self.index.lock().await;
        Ok(self.remove_locked(&mut index, key).await?.is_some())
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let mut index = self.index.lock().await;
        self.backend.clear().await?;
        let removed = index.records.len();
        index.records.clear();
        index.total_bytes = 0;
        index.last_cleanup_at = None;
        info!(removed, "Cache cleared");
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        self.index.lock().await.stats()
    }

    /// Record for `key` without touching its access time. Expired entries
    /// are still returned.
    pub async fn entry_info(&self, key: &str) -> Option<EntryRecord> {
        self.index.lock().await.records.get(key).cloned()
    }

    /// Whether a live, unexpired entry exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        let index = self.index.lock().await;
        let now = self.clock.now();
        index
            .records
            .get(key)
            .is_some_and(|r| !self.is_expired(r, now))
    }

    /// Keys of every entry with the given type, sorted.
    pub async fn keys_by_type(&self, entry_type: EntryType) -> Vec<String> {
        let index = self.index.lock().await;
        let mut keys: Vec<String> = index
            .records
            .values()
            .filter(|r| r.entry_type == entry_type)
            .map(|r| r.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Periodic maintenance, at most once per cleanup interval.
    ///
    /// Returns `None` when the last pass is too recent.
    pub async fn maintain(&self) -> Result<Option<GcResult>, CacheError> {
        {
            let index = self.index.lock().await;
            if let Some(last) = index.last_cleanup_at {
                if age(last, self.clock.now()) < self.config.cleanup_interval {
                    debug!(last_cleanup_at = %last, "Cache maintenance not due");
                    return Ok(None);
                }
            }
        }
        self.force_maintain().await.map(Some)
    }

    /// Purge expired entries and bring the total back under quota, now.
    pub async fn force_maintain(&self) -> Result<GcResult, CacheError> {
        let started = Instant::now();
        let mut index = self.index.lock().await;
        let now = self.clock.now();

        let expired: Vec<String> = index
            .records
            .values()
            .filter(|r| self.is_expired(r, now))
            .map(|r| r.key.clone())
            .collect();

        let mut result = GcResult::default();
        for key in expired {
            match self.remove_locked(&mut index, &key).await {
                Ok(Some(size)) => {
                    result.entries_removed += 1;
                    result.bytes_freed += size;
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to purge expired entry"),
            }
        }

        if index.total_bytes > self.config.max_cache_bytes {
            let needed = index.total_bytes - self.config.max_cache_bytes;
            let evicted = self.evict_locked(&mut index, needed, None, false).await;
            result.entries_removed += evicted.entries_removed;
            result.bytes_freed += evicted.bytes_freed;
        }

        index.last_cleanup_at = Some(now);
        self.backend.write_stats(&index.stats()).await?;

        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            entries_removed = result.entries_removed,
            bytes_freed = result.bytes_freed,
            duration_ms = result.duration_ms,
            "Cache maintenance complete"
        );
        Ok(result)
    }

    /// Run [`maintain`](Self::maintain) every `interval` until `token` is cancelled.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache maintenance daemon stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = store.maintain().await {
                            warn!(error = %e, "Cache maintenance failed");
                        }
                    }
                }
            }
        })
    }

    /// Free at least `needed` bytes.
    ///
    /// Candidates are visited least recently used first. The first sweep only
    /// takes entries idle for more than half the maximum age or larger than
    /// the big-entry threshold. When `lru_fallback` is set and that was not
    /// enough, a second sweep takes the remaining candidates in LRU order.
    async fn evict_locked(
        &self,
        index: &mut Index,
        needed: u64,
        exclude: Option<&str>,
        lru_fallback: bool,
    ) -> GcResult {
        let started = Instant::now();
        let now = self.clock.now();
        let stale_after = self.config.max_entry_age / 2;

        let mut candidates: Vec<(DateTime<Utc>, String, u64)> = index
            .records
            .values()
            .filter(|r| Some(r.key.as_str()) != exclude)
            .map(|r| (r.last_accessed_at, r.key.clone(), r.size_bytes))
            .collect();
        candidates.sort();

        let mut result = GcResult::default();
        let mut skipped = Vec::new();

        for (last_accessed_at, key, size) in candidates {
            if result.bytes_freed >= needed {
                break;
            }
            let preferred =
                age(last_accessed_at, now) > stale_after || size > self.config.big_entry_bytes;
            if !preferred {
                skipped.push(key);
                continue;
            }
            self.evict_one(index, &key, &mut result).await;
        }

        if lru_fallback {
            for key in skipped {
                if result.bytes_freed >= needed {
                    break;
                }
                self.evict_one(index, &key, &mut result).await;
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn evict_one(&self, index: &mut Index, key: &str, result: &mut GcResult) {
        match self.remove_locked(index, key).await {
            Ok(Some(size)) => {
                debug!(key, size, "Evicted cache entry");
                self.evictions.fetch_add(1, Ordering::Relaxed);
                result.entries_removed += 1;
                result.bytes_freed += size;
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "Failed to evict cache entry"),
        }
    }

    /// Remove from backend then index. Returns the freed size when the key existed.
    async fn remove_locked(&self, index: &mut Index, key: &str) -> Result<Option<u64>, CacheError> {
        if !index.records.contains_key(key) {
            return Ok(None);
        }
        self.backend.remove(key).await?;
        let removed = index.records.remove(key).map(|r| r.size_bytes);
        if let Some(size) = removed {
            index.total_bytes -= size;
        }
        Ok(removed)
    }
}

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
