//! Bookstream - progressive EPUB and PDF loading over the network
//!
//! This library fetches just enough of a remote document to start rendering,
//! keeps fetching the rest in the background, and persists every fetched piece
//! in a size-bounded local cache so repeat sessions don't re-download.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────┐
//!  open_document ─►│    DocumentLoader    │──► LoadStream (progress → Ready | Failed)
//!                  └──────────┬───────────┘
//!              ┌──────────────┴──────────────┐
//!              ▼                             ▼
//!   ┌─────────────────────┐       ┌─────────────────────┐
//!   │ MetadataExtractor   │       │ RangeLoader         │
//!   │ ChapterManager      │       │ ConnectionProbe     │
//!   │ (EPUB)              │       │ ChunkPlanner (PDF)  │
//!   └──────────┬──────────┘       └──────────┬──────────┘
//!              └──────────────┬──────────────┘
//!                             ▼
//!                  ┌──────────────────────┐
//!                  │      CacheStore      │  one instance, one quota
//!                  └──────────────────────┘
//! ```
//!
//! Both loaders run their stages through the shared
//! [`streaming::StreamingOrchestrator`], which enforces monotonic progress and
//! retries recoverable failures.

pub mod cache;
pub mod config;
pub mod epub;
pub mod error;
pub mod loader;
pub mod logging;
pub mod network;
pub mod pdf;
pub mod streaming;
pub mod telemetry;
pub mod warm;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheStats, CacheStore, CacheValue, EntryType};
pub use config::BookstreamConfig;
pub use error::{ErrorKind, StreamingError};
pub use loader::{DocumentHandle, DocumentKind, DocumentLoader, LoaderBuilder, LoaderError};
pub use streaming::{LoadEvent, LoadStream, Stage, StreamingProgress};
