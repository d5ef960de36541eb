//! Worker pool: runs jobs concurrently under a time budget, with retries.
//!
//! ## Why a supervisor per attempt?
//!
//! Every attempt runs in its own `tokio::spawn`ed task wrapped in
//! `tokio::time::timeout`. If the attempt overruns its budget or panics, the
//! task's own cleanup never runs, so the pool runs the failure callback
//! itself from the [`RunScope`] it shared with the task: the ledger tells it
//! which files to delete and the scope tells it which stage was active.
//!
//! ## Retry policy
//!
//! Only failures whose [`FailureKind::is_retryable`] is true are retried, up
//! to `max_attempts` in total. Attempt `n > 1` waits
//! `retry_backoff_ms * 2^(n-2)` first. Between attempts the failed attempt's
//! artifacts are purged and the upload is kept; the idempotency key makes a
//! retry after a committed insert end as `Duplicate`.
//!
//! An attempt cut off during `Persisting` or `CleaningUp` may already have
//! committed its rows. The supervisor asks the store first; if the records
//! exist, the attempt counts as completed and its artifacts stay.
//!
//! [`FailureKind::is_retryable`]: crate::error::FailureKind::is_retryable

use crate::config::IngestConfig;
use crate::document::UploadedDocument;
use crate::error::IngestError;
use crate::job::{
    on_permanent_failure, remove_private_upload, run_attempt, source_key, Attempt,
    AttemptOutcome, AttemptReport, JobContext, RunScope, Stage,
};
use crate::output::JobOutcome;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};

pub struct WorkerPool {
    ctx: Arc<JobContext>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    max_attempts: u32,
    job_timeout: Duration,
    retry_backoff_ms: u64,
}

impl WorkerPool {
    pub fn new(ctx: JobContext, config: &IngestConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            ctx: Arc::new(ctx),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            max_attempts: config.max_attempts.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// Override the per-attempt time budget.
    pub fn with_job_timeout(mut self, budget: Duration) -> Self {
        self.job_timeout = budget;
        self
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Run every document, at most `concurrency` at a time.
    ///
    /// Outcomes come back in completion order.
    pub async fn run_all(&self, docs: Vec<UploadedDocument>) -> Vec<JobOutcome> {
        let total = docs.len();
        self.ctx.progress.on_batch_start(total);

        let outcomes: Vec<JobOutcome> = stream::iter(docs)
            .map(|doc| self.process(doc))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let success = outcomes.iter().filter(|o| o.is_success()).count();
        info!("Batch finished: {}/{} job(s) succeeded", success, total);
        self.ctx.progress.on_batch_complete(total, success);
        outcomes
    }

    /// Run one document to its final outcome, retrying where allowed.
    pub async fn process(&self, doc: UploadedDocument) -> JobOutcome {
        // The semaphore is never closed, so acquire only fails if it were.
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        };

        let started = Instant::now();
        let mut number = 1;
        loop {
            if number > 1 {
                let backoff = self.retry_backoff_ms * 2u64.pow(number - 2);
                info!(
                    "'{}': retry {}/{} after {}ms",
                    doc.original_name, number, self.max_attempts, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            let attempt = Attempt {
                number,
                max: self.max_attempts,
            };
            self.ctx.progress.on_job_start(&doc.original_name, number);
            let report = self.supervise(&doc, attempt).await;

            if report.will_retry() {
                number += 1;
                continue;
            }

            let outcome = report.into_outcome(&doc, number, started.elapsed());
            self.ctx.progress.on_job_complete(&outcome);
            return outcome;
        }
    }

    /// Run one attempt in its own task and clean up if it never reports.
    async fn supervise(&self, doc: &UploadedDocument, attempt: Attempt) -> AttemptReport {
        let scope = Arc::new(RunScope::new());
        let budget = self.job_timeout;

        let handle = {
            let ctx = Arc::clone(&self.ctx);
            let scope = Arc::clone(&scope);
            let doc = doc.clone();
            tokio::spawn(async move {
                tokio::time::timeout(budget, run_attempt(&ctx, &doc, &scope, attempt)).await
            })
        };

        let error = match handle.await {
            Ok(Ok(report)) => return report,
            Ok(Err(_)) => IngestError::JobTimeout { budget },
            Err(e) => IngestError::Internal(format!(
                "job task for '{}' died: {e}",
                doc.original_name
            )),
        };

        let stage = scope.stage();
        if let Some(report) = self.recover_committed(doc, &scope, stage).await {
            return report;
        }

        let kind = error.kind();
        let will_retry = attempt.will_retry(kind);
        let message = error.to_string();
        warn!(
            "'{}': attempt {} abandoned during {}: {}",
            doc.original_name, attempt.number, stage, message
        );
        self.ctx
            .progress
            .on_job_failed(&doc.original_name, stage, &message, will_retry);
        on_permanent_failure(
            &self.ctx.storage,
            doc,
            stage,
            &message,
            &scope.ledger,
            will_retry,
        )
        .await;

        AttemptReport {
            outcome: AttemptOutcome::Failed {
                stage,
                kind,
                message,
                will_retry,
            },
            skipped: Vec::new(),
        }
    }

    /// If an abandoned attempt's insert landed, keep what it wrote and report
    /// it as completed.
    async fn recover_committed(
        &self,
        doc: &UploadedDocument,
        scope: &RunScope,
        stage: Stage,
    ) -> Option<AttemptReport> {
        if !matches!(stage, Stage::Persisting | Stage::CleaningUp) {
            return None;
        }
        let found = match self.ctx.store.source_records(&source_key(&doc.storage_key)).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(
                    "'{}': could not check for stored records after cancellation: {}",
                    doc.original_name, e
                );
                return None;
            }
        };

        warn!(
            "'{}': attempt cancelled during {} after its {} exam(s) were stored; keeping artifacts",
            doc.original_name,
            stage,
            found.exam_ids.len()
        );
        scope.ledger.commit();
        remove_private_upload(&self.ctx.storage, doc).await;

        Some(AttemptReport {
            outcome: AttemptOutcome::Completed {
                exam_ids: found.exam_ids,
                questions: found.questions,
            },
            skipped: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentFormat;
    use crate::error::FailureKind;
    use crate::output::JobStatus;
    use crate::pipeline::gateway::CompletionGateway;
    use crate::pipeline::ocr::TextRecognizer;
    use crate::store::MemoryExamStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct PanickingGateway;

    #[async_trait]
    impl CompletionGateway for PanickingGateway {
        async fn complete(&self, _prompt: &str) -> Result<String, IngestError> {
            panic!("gateway exploded");
        }
    }

    struct CountingFailGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionGateway for CountingFailGateway {
        async fn complete(&self, _prompt: &str) -> Result<String, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Transport {
                endpoint: "http://127.0.0.1:1".into(),
                detail: "connection refused".into(),
            })
        }
    }

    struct FixedRecognizer;

    #[async_trait]
    impl TextRecognizer for FixedRecognizer {
        async fn recognize(
            &self,
            _path: &Path,
            _format: DocumentFormat,
        ) -> Result<Option<String>, IngestError> {
            Ok(Some("1. Name the capital of Kenya.".into()))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn config(root: &Path, attempts: u32) -> IngestConfig {
        IngestConfig::builder()
            .storage_root(root)
            .max_attempts(attempts)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    async fn image_upload(ctx: &JobContext) -> UploadedDocument {
        ctx.storage
            .write_public("exam_images/scan.png", b"png")
            .await
            .unwrap();
        UploadedDocument {
            storage_key: "public/exam_images/scan.png".into(),
            original_name: "scan.png".into(),
            declared_extension: "png".into(),
            public_image_path: Some("exam_images/scan.png".into()),
        }
    }

    #[tokio::test]
    async fn panic_is_caught_and_upload_removed() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), 1);
        let store = Arc::new(MemoryExamStore::new());
        let ctx = JobContext::new(&cfg, store, Arc::new(PanickingGateway))
            .with_recognizer(Arc::new(FixedRecognizer));
        let doc = image_upload(&ctx).await;
        let pool = WorkerPool::new(ctx, &cfg);

        let outcome = pool.process(doc.clone()).await;
        match outcome.status {
            JobStatus::Failed { stage, kind, .. } => {
                assert_eq!(stage, Stage::Calling);
                assert_eq!(kind, FailureKind::Internal);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!pool.context().storage.public_exists("exam_images/scan.png").await);
    }

    #[tokio::test]
    async fn retryable_failures_use_every_attempt() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), 3);
        let gateway = Arc::new(CountingFailGateway {
            calls: AtomicUsize::new(0),
        });
        let ctx = JobContext::new(&cfg, Arc::new(MemoryExamStore::new()), gateway.clone())
            .with_recognizer(Arc::new(FixedRecognizer));
        let doc = image_upload(&ctx).await;
        let pool = WorkerPool::new(ctx, &cfg);

        let outcome = pool.process(doc.clone()).await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            outcome.status,
            JobStatus::Failed {
                kind: FailureKind::Transport,
                retryable: true,
                ..
            }
        ));
        // Kept between attempts, removed after the last.
        assert!(!pool.context().storage.public_exists("exam_images/scan.png").await);
    }
}
