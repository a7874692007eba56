//! Progress events and the per-session event stream.
//!
//! A load session produces a sequence of [`LoadEvent`]s: any number of
//! `Progress` updates followed by exactly one `Ready` or `Failed`.
//!
//! ```text
//!  loader task                                   caller
//!  ───────────                                   ──────
//!  ProgressReporter::report ──┐
//!  ProgressReporter::report ──┼── mpsc ──► LoadStream (impl Stream)
//!  Completion::ready / fail ──┘
//! ```
//!
//! The reporter is the only way progress reaches the stream, and it drops
//! updates that would move a stage backwards or lower the percentage.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::StreamingError;

/// A loading stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    Metadata,
    Structure,
    Preloading,
    Streaming,
    Downloading,
    Processing,
    Ready,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Metadata => "metadata",
            Stage::Structure => "structure",
            Stage::Preloading => "preloading",
            Stage::Streaming => "streaming",
            Stage::Downloading => "downloading",
            Stage::Processing => "processing",
            Stage::Ready => "ready",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage order of an EPUB session.
pub const EPUB_STAGES: &[Stage] = &[
    Stage::Metadata,
    Stage::Structure,
    Stage::Preloading,
    Stage::Streaming,
    Stage::Ready,
];

/// Stage order of a PDF session.
pub const PDF_STAGES: &[Stage] = &[
    Stage::Initializing,
    Stage::Downloading,
    Stage::Processing,
    Stage::Ready,
];

/// One progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingProgress {
    pub stage: Stage,
    /// 0 to 100.
    pub percentage: f32,
    pub message: String,
    pub chapters_loaded: Option<u32>,
    pub total_chapters: Option<u32>,
    pub bytes_loaded: Option<u64>,
    pub total_bytes: Option<u64>,
    pub total_pages: Option<u32>,
}

impl StreamingProgress {
    pub fn new(stage: Stage, percentage: f32, message: impl Into<String>) -> Self {
        Self {
            stage,
            percentage,
            message: message.into(),
            chapters_loaded: None,
            total_chapters: None,
            bytes_loaded: None,
            total_bytes: None,
            total_pages: None,
        }
    }

    pub fn with_chapters(mut self, loaded: u32, total: u32) -> Self {
        self.chapters_loaded = Some(loaded);
        self.total_chapters = Some(total);
        self
    }

    pub fn with_bytes(mut self, loaded: u64, total: Option<u64>) -> Self {
        self.bytes_loaded = Some(loaded);
        self.total_bytes = total;
        self
    }

    pub fn with_pages(mut self, total_pages: u32) -> Self {
        self.total_pages = Some(total_pages);
        self
    }
}

/// An item of a [`LoadStream`].
#[derive(Debug, Clone)]
pub enum LoadEvent<H> {
    Progress(StreamingProgress),
    Ready(H),
    Failed(StreamingError),
}

struct ReporterState {
    stages: &'static [Stage],
    stage_index: Option<usize>,
    percentage: f32,
    closed: bool,
}

type ProgressSink = Arc<dyn Fn(StreamingProgress) + Send + Sync>;

/// Monotonic progress emitter for one session. Clones share state.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: ProgressSink,
    state: Arc<Mutex<ReporterState>>,
}

impl ProgressReporter {
    pub fn new(
        stages: &'static [Stage],
        sink: impl Fn(StreamingProgress) + Send + Sync + 'static,
    ) -> Self {
        Self {
            sink: Arc::new(sink),
            state: Arc::new(Mutex::new(ReporterState {
                stages,
                stage_index: None,
                percentage: 0.0,
                closed: false,
            })),
        }
    }

    /// A reporter whose updates go nowhere.
    pub fn silent(stages: &'static [Stage]) -> Self {
        Self::new(stages, |_| {})
    }

    /// Emit `progress` unless it would move the stage backwards.
    ///
    /// The percentage is clamped to `[previous, 100]`. Returns whether the
    /// update was emitted.
    pub fn report(&self, mut progress: StreamingProgress) -> bool {
        // The sink runs under the lock so nothing is emitted after close().
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let Some(index) = state.stages.iter().position(|s| *s == progress.stage) else {
            debug!(stage = %progress.stage, "Dropping progress for a stage outside this session");
            return false;
        };
        if state.stage_index.is_some_and(|current| index < current) {
            trace!(stage = %progress.stage, "Dropping backwards stage transition");
            return false;
        }
        if state.stage_index != Some(index) {
            debug!(stage = %progress.stage, "Stage transition");
        }
        state.stage_index = Some(index);
        progress.percentage = progress.percentage.clamp(state.percentage, 100.0);
        state.percentage = progress.percentage;
        (self.sink)(progress);
        true
    }

    /// Start over from the first stage after a retry. The percentage floor is
    /// kept, so observers never see it decrease.
    pub fn restart(&self) {
        self.state.lock().stage_index = None;
    }

    pub fn stage(&self) -> Option<Stage> {
        let state = self.state.lock();
        state.stage_index.map(|i| state.stages[i])
    }

    pub fn percentage(&self) -> f32 {
        self.state.lock().percentage
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Sends the single terminal event of a session.
pub struct Completion<H> {
    tx: mpsc::UnboundedSender<LoadEvent<H>>,
    reporter: ProgressReporter,
}

impl<H> Completion<H> {
    pub fn ready(self, handle: H) {
        self.reporter.close();
        let _ = self.tx.send(LoadEvent::Ready(handle));
    }

    pub fn fail(self, error: StreamingError) {
        self.reporter.close();
        let _ = self.tx.send(LoadEvent::Failed(error));
    }
}

/// Open a session channel.
pub fn load_channel<H: Send + 'static>(
    stages: &'static [Stage],
) -> (ProgressReporter, Completion<H>, LoadStream<H>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let progress_tx = tx.clone();
    let reporter = ProgressReporter::new(stages, move |progress| {
        let _ = progress_tx.send(LoadEvent::Progress(progress));
    });
    let completion = Completion {
        tx,
        reporter: reporter.clone(),
    };
    (reporter, completion, LoadStream { rx })
}

/// Stream of events for one load session.
pub struct LoadStream<H> {
    rx: mpsc::UnboundedReceiver<LoadEvent<H>>,
}

impl<H> fmt::Debug for LoadStream<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadStream").finish_non_exhaustive()
    }
}

impl<H> Stream for LoadStream<H> {
    type Item = LoadEvent<H>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<H> LoadStream<H> {
    /// Drain the stream, returning every progress update and the outcome.
    ///
    /// A stream that ends without a terminal event reports an abort.
    pub async fn finish(mut self) -> (Vec<StreamingProgress>, Result<H, StreamingError>) {
        let mut updates = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                LoadEvent::Progress(progress) => updates.push(progress),
                LoadEvent::Ready(handle) => return (updates, Ok(handle)),
                LoadEvent::Failed(error) => return (updates, Err(error)),
            }
        }
        (updates, Err(StreamingError::aborted()))
    }

    /// Wait for the outcome, discarding progress.
    pub async fn wait(self) -> Result<H, StreamingError> {
        self.finish().await.1
    }
}
