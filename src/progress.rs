//! Progress-callback trait for ingestion job events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] into the
//! [`crate::job::JobContext`] to receive events as jobs move through their
//! stages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a job-status table, or a
//! terminal progress bar without the library knowing how the host
//! application communicates. The trait is `Send + Sync` because the worker
//! pool runs jobs concurrently on `tokio::spawn`.
//!
//! # Example
//!
//! ```rust
//! use exam_ingest::{IngestProgressCallback, JobOutcome};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     finished: Arc<AtomicUsize>,
//! }
//!
//! impl IngestProgressCallback for CountingCallback {
//!     fn on_job_complete(&self, outcome: &JobOutcome) {
//!         let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{} finished ({} so far)", outcome.original_name, done);
//!     }
//! }
//!
//! let cb: Arc<dyn IngestProgressCallback> = Arc::new(CountingCallback {
//!     finished: Arc::new(AtomicUsize::new(0)),
//! });
//! ```

use crate::job::Stage;
use crate::output::JobOutcome;
use std::sync::Arc;

/// Called by the orchestrator and the worker pool as jobs progress.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// With `concurrency > 1` every method may be called concurrently for
/// different jobs. Implementations must protect shared mutable state with
/// appropriate synchronisation primitives (e.g. `Mutex`, `AtomicUsize`).
pub trait IngestProgressCallback: Send + Sync {
    /// Called once before the pool starts a batch.
    fn on_batch_start(&self, total_jobs: usize) {
        let _ = total_jobs;
    }

    /// Called when an attempt of a job begins.
    ///
    /// # Arguments
    /// * `original_name` — the uploaded file's name
    /// * `attempt`       — 1-based attempt number
    fn on_job_start(&self, original_name: &str, attempt: u32) {
        let _ = (original_name, attempt);
    }

    /// Called each time a job enters a new stage.
    fn on_stage(&self, original_name: &str, stage: Stage) {
        let _ = (original_name, stage);
    }

    /// Called when an attempt fails.
    ///
    /// # Arguments
    /// * `stage`      — the stage that failed
    /// * `error`      — human-readable error description
    /// * `will_retry` — whether the pool will run another attempt
    fn on_job_failed(&self, original_name: &str, stage: Stage, error: &str, will_retry: bool) {
        let _ = (original_name, stage, error, will_retry);
    }

    /// Called once per job with its final outcome.
    fn on_job_complete(&self, outcome: &JobOutcome) {
        let _ = outcome;
    }

    /// Called once after every job of a batch has finished.
    ///
    /// # Arguments
    /// * `total_jobs`    — jobs in the batch
    /// * `success_count` — jobs that completed or were duplicates
    fn on_batch_complete(&self, total_jobs: usize, success_count: usize) {
        let _ = (total_jobs, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::job::JobContext`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;
