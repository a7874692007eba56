//! Persistent, size-bounded cache shared by every loader session.
//!
//! ```text
//!   CacheStore ── single async mutex ── Index { records, total_bytes }
//!       │
//!       └── Arc<dyn CacheBackend> ── MemoryBackend | DiskBackend
//! ```
//!
//! Keys are plain strings namespaced by the caller:
//!
//! | Key                          | Type     | Written by        |
//! |------------------------------|----------|-------------------|
//! | `epub-meta:{key}`            | metadata | MetadataExtractor |
//! | `epub-toc:{key}`             | toc      | MetadataExtractor |
//! | `chapter:{identifier}:{href}`| content  | ChapterManager    |
//! | `pdf:{key}`                  | content  | RangeLoader       |
//! | `pdf-meta:{key}`             | metadata | RangeLoader       |
//! | `pdf-chunk:{key}:{index}`    | content  | ChunkReader       |
//! | `page:{fingerprint}:{n}`     | content  | RangeLoader       |
//! | `cover:{id}`                 | cover    | CoverPrefetcher   |
//! | `prefetch:{id}`              | metadata | warm-cache feed   |

mod backend;
mod clock;
mod disk;
mod entry;
mod memory;
mod store;

pub use backend::{BoxFuture, CacheBackend, CacheError, PersistedState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::DiskBackend;
pub use entry::{CacheStats, CacheValue, EntryRecord, EntryType, GcResult, PayloadEncoding};
pub use memory::MemoryBackend;
pub use store::{CacheCounters, CacheStore};
