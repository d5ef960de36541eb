//! Job orchestration: one upload → extracted, prompted, called, normalised,
//! persisted and cleaned up.
//!
//! ## State machine
//!
//! ```text
//!  Extracting ─▶ Prompting ─▶ Calling ─▶ Normalizing ─▶ Persisting ─▶ CleaningUp ─▶ Done
//!      │             │           │            │              │
//!      └─────────────┴───────────┴────────────┴──────────────┴──▶ Failed ──(callback)──▶ PermanentlyFailed
//! ```
//!
//! [`transition`] is a pure function over [`JobState`] and [`StepResult`], so
//! every edge is tested without running a pipeline. The driver in
//! [`run_attempt`] executes the stage for the current state, feeds the result
//! through `transition`, and runs the failure callback
//! ([`on_permanent_failure`]) when a stage fails.
//!
//! ## Cleanup guarantees
//!
//! * Success: the private upload is deleted; a public image upload is kept
//!   because the exam record points at it.
//! * Failure: every file the attempt created is deleted, and so is the upload
//!   unless the worker pool is going to retry.
//!
//! ## Idempotency
//!
//! Each run derives `source_key = hex(sha256(storage_key))` and tags its
//! records with it. Persisting checks the key first, so a retry after a
//! committed insert ends as [`JobStatus::Duplicate`] instead of inserting
//! twice.

use crate::config::{IngestConfig, PromptVariant};
use crate::document::{ExtractionFailure, ExtractionResult, UploadedDocument};
use crate::error::{FailureKind, IngestError};
use crate::output::{JobOutcome, JobStatus, NormalizedExamRecord, SkippedQuestion};
use crate::pipeline::artifact::ArtifactLedger;
use crate::pipeline::extract::extract;
use crate::pipeline::gateway::CompletionGateway;
use crate::pipeline::normalize::normalize;
use crate::pipeline::ocr::{NoopRecognizer, TextRecognizer};
use crate::pipeline::persist::{persist, PersistOutcome, PersistRequest};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::build_prompt;
use crate::storage::Storage;
use crate::store::ExamStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// ── States ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracting,
    Prompting,
    Calling,
    Normalizing,
    Persisting,
    CleaningUp,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extracting,
        Stage::Prompting,
        Stage::Calling,
        Stage::Normalizing,
        Stage::Persisting,
        Stage::CleaningUp,
    ];

    /// The stage after this one, or `None` after CleaningUp.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Extracting => Some(Stage::Prompting),
            Stage::Prompting => Some(Stage::Calling),
            Stage::Calling => Some(Stage::Normalizing),
            Stage::Normalizing => Some(Stage::Persisting),
            Stage::Persisting => Some(Stage::CleaningUp),
            Stage::CleaningUp => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Extracting => "extracting",
            Stage::Prompting => "prompting",
            Stage::Calling => "calling",
            Stage::Normalizing => "normalizing",
            Stage::Persisting => "persisting",
            Stage::CleaningUp => "cleaning up",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum JobState {
    Active(Stage),
    Done,
    /// A stage failed; the failure callback has not run yet.
    Failed { stage: Stage, error: IngestError },
    /// The failure callback ran. Terminal.
    PermanentlyFailed { stage: Stage, kind: FailureKind },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::PermanentlyFailed { .. })
    }
}

/// What happened since the last transition.
#[derive(Debug)]
pub enum StepResult {
    /// The current stage finished.
    Advanced,
    Failed(IngestError),
    /// The failure callback finished.
    CallbackFinished,
}

/// Compute the next state. Pure; terminal states absorb every input.
pub fn transition(state: JobState, step: StepResult) -> JobState {
    match (state, step) {
        (JobState::Active(stage), StepResult::Advanced) => match stage.next() {
            Some(next) => JobState::Active(next),
            None => JobState::Done,
        },
        (JobState::Active(stage), StepResult::Failed(error)) => JobState::Failed { stage, error },
        (JobState::Failed { stage, error }, StepResult::CallbackFinished) => {
            JobState::PermanentlyFailed {
                stage,
                kind: error.kind(),
            }
        }
        (state, _) => state,
    }
}

/// Idempotency key of an upload: hex SHA-256 of its storage key.
pub fn source_key(storage_key: &str) -> String {
    hex::encode(Sha256::digest(storage_key.as_bytes()))
}

// ── Context ──────────────────────────────────────────────────────────────

/// Collaborators shared by every job a process runs.
pub struct JobContext {
    pub storage: Storage,
    pub store: Arc<dyn ExamStore>,
    pub gateway: Arc<dyn CompletionGateway>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub progress: ProgressCallback,
    pub prompt_variant: PromptVariant,
    pub max_prompt_chars: usize,
}

impl JobContext {
    /// Context with the no-op recognizer and no progress reporting.
    pub fn new(
        config: &IngestConfig,
        store: Arc<dyn ExamStore>,
        gateway: Arc<dyn CompletionGateway>,
    ) -> Self {
        Self {
            storage: Storage::new(config.storage_root.clone()),
            store,
            gateway,
            recognizer: Arc::new(NoopRecognizer),
            progress: Arc::new(NoopProgressCallback),
            prompt_variant: config.prompt_variant,
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn TextRecognizer>) -> Self {
        self.recognizer = recognizer;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }
}

/// State shared between one attempt and whoever supervises it, so the
/// supervisor can clean up after an attempt it had to abandon.
#[derive(Debug)]
pub struct RunScope {
    pub ledger: ArtifactLedger,
    stage: Mutex<Stage>,
}

impl Default for RunScope {
    fn default() -> Self {
        Self {
            ledger: ArtifactLedger::new(),
            stage: Mutex::new(Stage::Extracting),
        }
    }
}

impl RunScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stage the attempt is in (or was in when it stopped).
    pub fn stage(&self) -> Stage {
        self.stage.lock().map(|s| *s).unwrap_or(Stage::Extracting)
    }

    fn enter(&self, stage: Stage) {
        if let Ok(mut s) = self.stage.lock() {
            *s = stage;
        }
    }
}

/// Position of an attempt within the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub fn single() -> Self {
        Self { number: 1, max: 1 }
    }

    pub fn has_retries_left(self) -> bool {
        self.number < self.max
    }

    /// Whether a failure of this kind on this attempt leads to another one.
    pub fn will_retry(self, kind: FailureKind) -> bool {
        kind.is_retryable() && self.has_retries_left()
    }
}

// ── Attempt results ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Completed {
        exam_ids: Vec<i64>,
        questions: usize,
    },
    Duplicate,
    Failed {
        stage: Stage,
        kind: FailureKind,
        message: String,
        will_retry: bool,
    },
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    pub skipped: Vec<SkippedQuestion>,
}

impl AttemptReport {
    pub fn will_retry(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Failed { will_retry: true, .. })
    }

    pub fn into_outcome(
        self,
        doc: &UploadedDocument,
        attempts: u32,
        elapsed: Duration,
    ) -> JobOutcome {
        let status = match self.outcome {
            AttemptOutcome::Completed {
                exam_ids,
                questions,
            } => JobStatus::Completed {
                exam_ids,
                questions,
            },
            AttemptOutcome::Duplicate => JobStatus::Duplicate,
            AttemptOutcome::Failed {
                stage,
                kind,
                message,
                ..
            } => JobStatus::Failed {
                stage,
                kind,
                message,
                retryable: kind.is_retryable(),
            },
        };
        JobOutcome {
            original_name: doc.original_name.clone(),
            storage_key: doc.storage_key.clone(),
            attempts,
            duration_ms: elapsed.as_millis() as u64,
            skipped: self.skipped,
            status,
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────

/// Run one job once, without a time budget or retries.
///
/// Never returns an error: every failure ends up in the outcome.
pub async fn run_job(ctx: &JobContext, doc: &UploadedDocument) -> JobOutcome {
    let started = Instant::now();
    let scope = RunScope::new();
    ctx.progress.on_job_start(&doc.original_name, 1);
    let report = run_attempt(ctx, doc, &scope, Attempt::single()).await;
    let outcome = report.into_outcome(doc, 1, started.elapsed());
    ctx.progress.on_job_complete(&outcome);
    outcome
}

/// Drive the state machine for one attempt.
pub async fn run_attempt(
    ctx: &JobContext,
    doc: &UploadedDocument,
    scope: &RunScope,
    attempt: Attempt,
) -> AttemptReport {
    let mut run = Run {
        ctx,
        doc,
        scope,
        source_key: source_key(&doc.storage_key),
        started: Instant::now(),
        extraction: None,
        prompt: None,
        raw_response: None,
        records: None,
        persisted: None,
        skipped: Vec::new(),
    };
    let mut failure: Option<(String, bool)> = None;
    let mut state = JobState::Active(Stage::Extracting);

    loop {
        state = match state {
            JobState::Active(stage) => {
                scope.enter(stage);
                ctx.progress.on_stage(&doc.original_name, stage);
                info!("'{}': {}", doc.original_name, stage);
                let step = run.step(stage).await;
                transition(JobState::Active(stage), step)
            }
            JobState::Failed { stage, error } => {
                let will_retry = attempt.will_retry(error.kind());
                let message = error.to_string();
                ctx.progress
                    .on_job_failed(&doc.original_name, stage, &message, will_retry);
                on_permanent_failure(&ctx.storage, doc, stage, &message, &scope.ledger, will_retry)
                    .await;
                failure = Some((message, will_retry));
                transition(JobState::Failed { stage, error }, StepResult::CallbackFinished)
            }
            JobState::PermanentlyFailed { stage, kind } => {
                let (message, will_retry) = failure.unwrap_or_default();
                return AttemptReport {
                    outcome: AttemptOutcome::Failed {
                        stage,
                        kind,
                        message,
                        will_retry,
                    },
                    skipped: run.skipped,
                };
            }
            JobState::Done => {
                let outcome = match run.persisted.take() {
                    Some(PersistOutcome::Inserted {
                        exam_ids,
                        questions,
                    }) => AttemptOutcome::Completed {
                        exam_ids,
                        questions,
                    },
                    Some(PersistOutcome::Duplicate) => AttemptOutcome::Duplicate,
                    None => AttemptOutcome::Failed {
                        stage: Stage::Persisting,
                        kind: FailureKind::Internal,
                        message: "run finished without a persistence result".into(),
                        will_retry: false,
                    },
                };
                info!("'{}': done", doc.original_name);
                return AttemptReport {
                    outcome,
                    skipped: run.skipped,
                };
            }
        };
    }
}

/// The failure callback.
///
/// Logs the failure with enough context to diagnose it, deletes every file
/// the attempt created (unless already committed), and deletes the upload
/// unless another attempt will need it. A public image that committed
/// records point at is kept.
pub async fn on_permanent_failure(
    storage: &Storage,
    doc: &UploadedDocument,
    stage: Stage,
    message: &str,
    ledger: &ArtifactLedger,
    will_retry: bool,
) {
    error!(
        "Job failed for '{}' (storage key {}, stage {}): {}",
        doc.original_name, doc.storage_key, stage, message
    );

    let removed = ledger.purge(storage).await;
    if removed > 0 {
        info!("Removed {} artifact(s) of failed run '{}'", removed, doc.original_name);
    }

    if will_retry {
        debug!("Keeping upload {} for retry", doc.storage_key);
        return;
    }

    let deleted = match doc.public_image_path.as_deref() {
        Some(_) if ledger.is_committed() => return,
        Some(image) => storage.delete_public(image).await,
        None => storage.delete(&doc.storage_key).await,
    };
    match deleted {
        Ok(true) => info!("Deleted upload {}", doc.storage_key),
        Ok(false) => {}
        Err(e) => warn!("Failed to delete upload {}: {}", doc.storage_key, e),
    }
}

/// Delete a document upload after its records are stored. Image uploads stay
/// because `image_ref` points at them.
pub(crate) async fn remove_private_upload(storage: &Storage, doc: &UploadedDocument) {
    if doc.public_image_path.is_some() {
        return;
    }
    match storage.delete(&doc.storage_key).await {
        Ok(_) => info!("Deleted temporary file: {}", doc.storage_key),
        Err(e) => warn!("Failed to delete upload {}: {}", doc.storage_key, e),
    }
}

/// Per-attempt stage outputs. Each stage consumes its predecessor's output.
struct Run<'a> {
    ctx: &'a JobContext,
    doc: &'a UploadedDocument,
    scope: &'a RunScope,
    source_key: String,
    started: Instant,
    extraction: Option<ExtractionResult>,
    prompt: Option<String>,
    raw_response: Option<String>,
    records: Option<Vec<NormalizedExamRecord>>,
    persisted: Option<PersistOutcome>,
    skipped: Vec<SkippedQuestion>,
}

impl Run<'_> {
    async fn step(&mut self, stage: Stage) -> StepResult {
        match self.execute(stage).await {
            Ok(()) => StepResult::Advanced,
            Err(e) => StepResult::Failed(e),
        }
    }

    async fn execute(&mut self, stage: Stage) -> Result<(), IngestError> {
        let ctx = self.ctx;
        let doc = self.doc;
        match stage {
            Stage::Extracting => {
                let result = extract(&ctx.storage, doc, ctx.recognizer.as_ref()).await?;
                if let ExtractionResult::Failed(failure) = result {
                    return Err(match failure {
                        ExtractionFailure::MissingSource { path } => {
                            IngestError::SourceMissing { path }
                        }
                        ExtractionFailure::Unreadable { detail } => IngestError::Extraction {
                            name: doc.original_name.clone(),
                            detail,
                        },
                    });
                }
                self.extraction = Some(result);
            }
            Stage::Prompting => {
                let text = match self.extraction.take() {
                    Some(ExtractionResult::Text(text)) => text,
                    Some(_) => {
                        return Err(IngestError::NoExtractableText {
                            name: doc.original_name.clone(),
                            image: doc.is_image(),
                        })
                    }
                    None => return Err(missing_input(stage)),
                };
                self.prompt = Some(build_prompt(
                    &text,
                    &doc.original_name,
                    ctx.prompt_variant,
                    ctx.max_prompt_chars,
                ));
            }
            Stage::Calling => {
                let prompt = self.prompt.take().ok_or_else(|| missing_input(stage))?;
                self.raw_response = Some(ctx.gateway.complete(&prompt).await?);
            }
            Stage::Normalizing => {
                let raw = self.raw_response.take().ok_or_else(|| missing_input(stage))?;
                let normalized = normalize(
                    &raw,
                    ctx.prompt_variant.response_shape(),
                    &doc.original_name,
                )?;
                self.skipped = normalized.skipped;
                self.records = Some(normalized.records);
            }
            Stage::Persisting => {
                let records = self.records.take().ok_or_else(|| missing_input(stage))?;
                let req = PersistRequest {
                    doc,
                    source_key: &self.source_key,
                    variant: ctx.prompt_variant,
                    started: self.started,
                };
                let outcome =
                    persist(&ctx.storage, ctx.store.as_ref(), &self.scope.ledger, req, records)
                        .await?;
                self.persisted = Some(outcome);
            }
            Stage::CleaningUp => remove_private_upload(&ctx.storage, doc).await,
        }
        Ok(())
    }
}

fn missing_input(stage: Stage) -> IngestError {
    IngestError::Internal(format!("stage '{stage}' started without its input"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> IngestError {
        IngestError::Upstream {
            status: 500,
            body: "boom".into(),
        }
    }

    #[test]
    fn advancing_walks_every_stage_then_done() {
        let mut state = JobState::Active(Stage::Extracting);
        let mut seen = vec![];
        while let JobState::Active(stage) = state {
            seen.push(stage);
            state = transition(state, StepResult::Advanced);
        }
        assert_eq!(seen, Stage::ALL.to_vec());
        assert!(matches!(state, JobState::Done));
    }

    #[test]
    fn failure_from_any_stage_records_that_stage() {
        for stage in Stage::ALL {
            let state = transition(JobState::Active(stage), StepResult::Failed(upstream()));
            match state {
                JobState::Failed { stage: s, .. } => assert_eq!(s, stage),
                other => panic!("expected Failed, got {other:?}"),
            }
        }
    }

    #[test]
    fn callback_moves_failed_to_permanently_failed() {
        let failed = JobState::Failed {
            stage: Stage::Calling,
            error: upstream(),
        };
        let state = transition(failed, StepResult::CallbackFinished);
        assert!(matches!(
            state,
            JobState::PermanentlyFailed {
                stage: Stage::Calling,
                kind: FailureKind::Upstream
            }
        ));
        assert!(state.is_terminal());
    }

    #[test]
    fn failed_waits_for_the_callback() {
        let failed = JobState::Failed {
            stage: Stage::Normalizing,
            error: IngestError::ResponseStructureInvalid,
        };
        let state = transition(failed, StepResult::Advanced);
        assert!(matches!(state, JobState::Failed { stage: Stage::Normalizing, .. }));
        assert!(!state.is_terminal());
    }

    #[test]
    fn terminal_states_absorb_everything() {
        let done = transition(JobState::Done, StepResult::Failed(upstream()));
        assert!(matches!(done, JobState::Done));

        let perm = JobState::PermanentlyFailed {
            stage: Stage::Extracting,
            kind: FailureKind::Storage,
        };
        let perm = transition(perm, StepResult::Advanced);
        assert!(matches!(perm, JobState::PermanentlyFailed { .. }));
    }

    #[test]
    fn callback_outside_failure_is_ignored() {
        let state = transition(JobState::Active(Stage::Calling), StepResult::CallbackFinished);
        assert!(matches!(state, JobState::Active(Stage::Calling)));
    }

    #[test]
    fn source_key_is_stable_hex_sha256() {
        let a = source_key("uploads/abc.pdf");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, source_key("uploads/abc.pdf"));
        assert_ne!(a, source_key("uploads/abd.pdf"));
    }

    #[test]
    fn retry_decision() {
        let first = Attempt { number: 1, max: 3 };
        assert!(first.will_retry(FailureKind::Transport));
        assert!(!first.will_retry(FailureKind::Configuration));
        assert!(!first.will_retry(FailureKind::JsonDecode));
        let last = Attempt { number: 3, max: 3 };
        assert!(!last.will_retry(FailureKind::Transport));
        assert!(!Attempt::single().has_retries_left());
    }
}
