//! Session plumbing shared by both loaders: stages, progress, retry.

mod orchestrator;
mod progress;
mod retry;

pub use orchestrator::StreamingOrchestrator;
pub use progress::{
    load_channel, Completion, LoadEvent, LoadStream, ProgressReporter, Stage, StreamingProgress,
    EPUB_STAGES, PDF_STAGES,
};
pub use retry::RetryPolicy;
