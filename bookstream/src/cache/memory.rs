//! In-process backend. Nothing survives a restart.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::backend::{BoxFuture, CacheBackend, CacheError, PersistedState};
use super::entry::{CacheStats, EntryRecord};

#[derive(Default)]
struct Inner {
    entries: HashMap<String, (EntryRecord, Bytes)>,
    last_cleanup_at: Option<DateTime<Utc>>,
}

/// Backend keeping records and payloads in a hash map.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self) -> BoxFuture<'_, Result<PersistedState, CacheError>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            Ok(PersistedState {
                records: inner.entries.values().map(|(r, _)| r.clone()).collect(),
                last_cleanup_at: inner.last_cleanup_at,
            })
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move { Ok(self.inner.lock().entries.get(key).map(|(_, p)| p.clone())) })
    }

    fn write<'a>(
        &'a self,
        record: &'a EntryRecord,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.inner
                .lock()
                .entries
                .insert(record.key.clone(), (record.clone(), payload));
            Ok(())
        })
    }

    fn touch<'a>(&'a self, record: &'a EntryRecord) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            if let Some((stored, _)) = self.inner.lock().entries.get_mut(&record.key) {
                *stored = record.clone();
            }
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.inner.lock().entries.remove(key);
            Ok(())
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.entries.clear();
            inner.last_cleanup_at = None;
            Ok(())
        })
    }

    fn write_stats<'a>(&'a self, stats: &'a CacheStats) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.inner.lock().last_cleanup_at = stats.last_cleanup_at;
            Ok(())
        })
    }
}
