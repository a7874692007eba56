//! On-disk backend.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//!   stats.json                  last cleanup time
//!   entries/
//!     <sha256(key)>.bin         payload
//!     <sha256(key)>.json        EntryRecord
//! ```
//!
//! The payload is written before its record and the record is removed before
//! its payload, so a record on disk always has a complete payload behind it.
//! Orphaned payloads left by a crash are swept by [`CacheBackend::load`].

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::backend::{BoxFuture, CacheBackend, CacheError, PersistedState};
use super::entry::{CacheStats, EntryRecord};

const ENTRIES_DIR: &str = "entries";
const STATS_FILE: &str = "stats.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    last_cleanup_at: Option<DateTime<Utc>>,
}

/// Backend persisting one payload file and one JSON record per entry.
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Create the backend, creating the directory tree if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(ENTRIES_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_stem(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.root
            .join(ENTRIES_DIR)
            .join(format!("{}.bin", Self::file_stem(key)))
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root
            .join(ENTRIES_DIR)
            .join(format!("{}.json", Self::file_stem(key)))
    }

    /// `<name>.<ext>.tmp`, so a payload and its record never share a temp file.
    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let temp_path = Self::temp_path(path);
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CacheBackend for DiskBackend {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn load(&self) -> BoxFuture<'_, Result<PersistedState, CacheError>> {
        Box::pin(async move {
            let mut state = PersistedState::default();

            match tokio::fs::read(self.root.join(STATS_FILE)).await {
                Ok(raw) => match serde_json::from_slice::<StatsFile>(&raw) {
                    Ok(stats) => state.last_cleanup_at = stats.last_cleanup_at,
                    Err(e) => warn!(error = %e, "Ignoring unreadable cache stats file"),
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let entries_dir = self.root.join(ENTRIES_DIR);
            let mut dir = tokio::fs::read_dir(&entries_dir).await?;
            let mut payload_stems = Vec::new();

            while let Some(item) = dir.next_entry().await? {
                let path = item.path();
                let stem = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(stem) => stem.to_string(),
                    None => continue,
                };

                match path.extension().and_then(|e| e.to_str()) {
                    Some("json") => {
                        let raw = tokio::fs::read(&path).await?;
                        match serde_json::from_slice::<EntryRecord>(&raw) {
                            Ok(record) => state.records.push(record),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "Dropping corrupt cache record");
                                Self::remove_if_exists(&path).await?;
                                Self::remove_if_exists(&path.with_extension("bin")).await?;
                            }
                        }
                    }
                    Some("bin") => payload_stems.push(stem),
                    Some("tmp") => Self::remove_if_exists(&path).await?,
                    _ => {}
                }
            }

            // Payloads without a record are unreachable.
            let live: std::collections::HashSet<String> = state
                .records
                .iter()
                .map(|r| Self::file_stem(&r.key))
                .collect();
            for stem in payload_stems {
                if !live.contains(&stem) {
                    debug!(stem = %stem, "Removing orphaned cache payload");
                    Self::remove_if_exists(&entries_dir.join(format!("{}.bin", stem))).await?;
                }
            }

            Ok(state)
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move {
            match tokio::fs::read(self.payload_path(key)).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn write<'a>(
        &'a self,
        record: &'a EntryRecord,
        payload: Bytes,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            Self::write_atomic(&self.payload_path(&record.key), &payload).await?;
            let raw = serde_json::to_vec(record)?;
            Self::write_atomic(&self.record_path(&record.key), &raw).await
        })
    }

    fn touch<'a>(&'a self, record: &'a EntryRecord) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let raw = serde_json::to_vec(record)?;
            Self::write_atomic(&self.record_path(&record.key), &raw).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            Self::remove_if_exists(&self.record_path(key)).await?;
            Self::remove_if_exists(&self.payload_path(key)).await
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async move {
            let entries_dir = self.root.join(ENTRIES_DIR);
            match tokio::fs::remove_dir_all(&entries_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tokio::fs::create_dir_all(&entries_dir).await?;
            Self::remove_if_exists(&self.root.join(STATS_FILE)).await
        })
    }

    fn write_stats<'a>(&'a self, stats: &'a CacheStats) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let raw = serde_json::to_vec_pretty(&StatsFile {
                last_cleanup_at: stats.last_cleanup_at,
            })?;
            Self::write_atomic(&self.root.join(STATS_FILE), &raw).await
        })
    }
}
