//! Shared stage driver with bounded retry.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::progress::ProgressReporter;
use super::retry::RetryPolicy;
use crate::error::StreamingError;

/// Runs a load attempt under a retry policy and a cancellation token.
///
/// The attempt closure receives the retry number (0 for the first attempt)
/// and reports its own stages through the session's [`ProgressReporter`].
/// Recoverable failures restart the reporter at the first stage after a
/// linear backoff; non-recoverable failures and cancellation end the
/// session immediately.
#[derive(Debug, Clone, Default)]
pub struct StreamingOrchestrator {
    policy: RetryPolicy,
}

impl StreamingOrchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, F, Fut>(
        &self,
        reporter: &ProgressReporter,
        token: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, StreamingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StreamingError>>,
    {
        let mut retry = 0u32;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(StreamingError::aborted()),
                result = attempt(retry) => result,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.recoverable {
                return Err(error.with_retry_count(retry));
            }

            let Some(delay) = self.policy.delay_for_retry(retry + 1) else {
                warn!(kind = %error.kind, retries = retry, error = %error, "Giving up after retries");
                return Err(error.with_retry_count(retry));
            };

            retry += 1;
            info!(
                kind = %error.kind,
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Recoverable failure, retrying"
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(StreamingError::aborted().with_retry_count(retry)),
                _ = tokio::time::sleep(delay) => {}
            }
            reporter.restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::streaming::progress::{Stage, StreamingProgress, EPUB_STAGES};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn orchestrator() -> StreamingOrchestrator {
        StreamingOrchestrator::new(RetryPolicy::linear(3, Duration::from_secs(1)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_error_is_retried_until_success() {
        let reporter = ProgressReporter::silent(EPUB_STAGES);
        let calls = AtomicU32::new(0);

        let result = orchestrator()
            .run(&reporter, &CancellationToken::new(), |retry| {
                calls.fetch_add(1, Ordering::SeqCst);
                let reporter = reporter.clone();
                async move {
                    assert!(reporter.report(StreamingProgress::new(Stage::Metadata, 10.0, "")));
                    if retry < 2 {
                        Err(StreamingError::network("reset"))
                    } else {
                        Ok(retry)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded_and_counted() {
        let reporter = ProgressReporter::silent(EPUB_STAGES);
        let started = tokio::time::Instant::now();

        let err = orchestrator()
            .run(&reporter, &CancellationToken::new(), |_| async {
                Err::<(), _>(StreamingError::timeout("slow"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.retry_count, 3);
        // 1s + 2s + 3s of linear backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_non_recoverable_error_fails_immediately() {
        let reporter = ProgressReporter::silent(EPUB_STAGES);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = orchestrator()
            .run(&reporter, &CancellationToken::new(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(StreamingError::parsing("not a pdf")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Parsing);
        assert_eq!(err.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_attempt() {
        let reporter = ProgressReporter::silent(EPUB_STAGES);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = orchestrator()
            .run(&reporter, &token, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err, StreamingError::aborted());
    }
}
