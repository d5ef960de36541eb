//! # exam-ingest
//!
//! Turn uploaded exam papers (PDF, DOCX, scanned images) into structured exam
//! records: exam metadata plus numbered question/answer pairs, extracted by a
//! Large Language Model and stored in SQLite.
//!
//! ## Why this crate?
//!
//! Exam papers arrive in every shape: typed DOCX, exported PDFs, phone photos
//! of printed sheets. Teachers want them searchable as questions and answers,
//! tagged with subject, class, term and curriculum. The text is easy to pull
//! out; the structure is not. This crate extracts the text, asks an LLM for a
//! strict JSON description of the paper, and then does the defensive work the
//! model cannot be trusted to do: recovering JSON from fenced or chatty
//! replies, dropping incomplete questions, coercing `term`, and making sure a
//! failed run leaves no files or rows behind.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Accept      validate extension + size, store privately (images publicly)
//!  ├─ 2. Extract     PDF/DOCX text (spawn_blocking), images via TextRecognizer
//!  ├─ 3. Prompt      template + file name + text truncated to 25 000 chars
//!  ├─ 4. Call        Gemini or any OpenAI-compatible chat endpoint
//!  ├─ 5. Normalise   envelope → fenced block → brace span, then typed records
//!  ├─ 6. Persist     copy images, render answer keys, one DB transaction
//!  └─ 7. Clean up    delete the private upload (or every artifact on failure)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam_ingest::{HttpGateway, IngestConfig, JobContext, SqliteExamStore, WorkerPool};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IngestConfig::builder()
//!         .api_key(std::env::var("GEMINI_API_KEY")?)
//!         .storage_root("storage")
//!         .build()?;
//!     let store = Arc::new(SqliteExamStore::connect(&config.database_url).await?);
//!     let gateway = Arc::new(HttpGateway::new(config.gateway_config())?);
//!     let ctx = JobContext::new(&config, store, gateway);
//!
//!     let upload = ctx.storage.accept_upload(Path::new("paper.pdf"), "paper.pdf").await?;
//!     let pool = WorkerPool::new(ctx, &config);
//!     for outcome in pool.run_all(vec![upload]).await {
//!         println!("{}", serde_json::to_string_pretty(&outcome)?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam-ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! exam-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod storage;
pub mod store;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    GatewayConfig, IngestConfig, IngestConfigBuilder, PromptVariant, Provider, ResponseShape,
};
pub use document::{DocumentFormat, ExtractionFailure, ExtractionResult, UploadedDocument};
pub use error::{FailureKind, IngestError};
pub use job::{run_job, source_key, JobContext, JobState, Stage};
pub use output::{
    JobOutcome, JobStatus, NormalizedExamRecord, QuestionAnswer, SkippedQuestion, StoredExam,
};
pub use pipeline::gateway::{CompletionGateway, HttpGateway};
pub use pipeline::ocr::{NoopRecognizer, TextRecognizer};
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use storage::Storage;
pub use store::{ExamPage, ExamStore, MemoryExamStore, SourceRecords, SqliteExamStore};
pub use worker::WorkerPool;
