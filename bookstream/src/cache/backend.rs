//! Persistence seam for the cache store.
//!
//! The [`CacheStore`](super::CacheStore) owns size accounting, expiry and
//! eviction; a `CacheBackend` only moves records and payloads to and from
//! storage. Backends never decide what to keep.
//!
//! Methods return [`BoxFuture`] so the store can hold an
//! `Arc<dyn CacheBackend>` and pick memory or disk at runtime.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::entry::{CacheStats, EntryRecord};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error in a persistent backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or structured payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hard quota: the entry does not fit even after eviction.
    #[error("quota exceeded: need {needed} bytes, {available} available (max: {max})")]
    QuotaExceeded { needed: u64, available: u64, max: u64 },

    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Everything a backend persisted, as read at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub records: Vec<EntryRecord>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

/// Storage for cache records and payloads.
///
/// All calls are made while the store holds its index lock, so
/// implementations never see concurrent mutations of the same key.
pub trait CacheBackend: Send + Sync {
    /// Short name for logs (`memory`, `disk`).
    fn name(&self) -> &'static str;

    /// Read every persisted record.
    fn load(&self) -> BoxFuture<'_, Result<PersistedState, CacheError>>;

    /// Read the payload stored under `key`, `None` when it is gone.
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>>;

    /// Store a record and its payload, replacing any previous one.
    fn write<'a>(
        &'a self,
        record: &'a EntryRecord,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Persist an updated record without rewriting the payload.
    fn touch<'a>(&'a self, record: &'a EntryRecord) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove a record and its payload. Missing keys are not an error.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove everything.
    fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Persist aggregate stats.
    fn write_stats<'a>(&'a self, stats: &'a CacheStats) -> BoxFuture<'a, Result<(), CacheError>>;
}
