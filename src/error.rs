//! Error types for the exam-ingest library.
//!
//! Two layers reflect two distinct consumers:
//!
//! * [`IngestError`] — what went wrong inside one pipeline run (missing
//!   credential, upstream 503, model returned prose instead of JSON, …).
//!   Every variant carries enough context to diagnose the run from the log
//!   line alone.
//!
//! * [`FailureKind`] — the coarse classification the worker pool uses to
//!   decide whether a failed run is worth retrying. It is `Copy` and
//!   serialisable so it can be stored in a [`crate::output::JobOutcome`].
//!
//! Errors never escape the orchestrator: [`crate::job::run_job`] always
//! returns an outcome. `IngestError` is only returned directly from the
//! building blocks (extractor, gateway, normaliser, store) so each can be
//! tested in isolation.
//!
//! A question that lacks required fields is *not* an error; it becomes a
//! [`crate::output::SkippedQuestion`] and the run carries on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Every failure a pipeline run (or one of its building blocks) can report.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// No API credential is available for the LLM gateway.
    #[error("LLM gateway is not configured: {detail}\nSet --api-key or EXAM_INGEST_API_KEY.")]
    Configuration { detail: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Storage / input ───────────────────────────────────────────────────
    /// The uploaded file disappeared before the run could read it.
    #[error("Source file not found in storage: '{path}'")]
    SourceMissing { path: PathBuf },

    /// A storage read/write/copy/delete failed.
    #[error("Storage operation failed for '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The upload boundary refused the file.
    #[error("Upload rejected for '{name}': {reason}")]
    UploadRejected { name: String, reason: String },

    /// The declared extension is not one the extractor understands.
    #[error("Unsupported file type '{extension}' for '{name}'")]
    UnsupportedFormat { name: String, extension: String },

    // ── Extraction ────────────────────────────────────────────────────────
    /// The document exists but its text layer could not be decoded.
    #[error("Text extraction failed for '{name}': {detail}")]
    Extraction { name: String, detail: String },

    /// Extraction produced no text, so there is nothing to send to the model.
    #[error("No text could be extracted from '{name}'{}", ocr_hint(.image))]
    NoExtractableText { name: String, image: bool },

    // ── LLM gateway ───────────────────────────────────────────────────────
    /// Network failure or timeout talking to the LLM endpoint.
    #[error("LLM request to '{endpoint}' failed: {detail}")]
    Transport { endpoint: String, detail: String },

    /// The LLM endpoint answered with a non-2xx status.
    #[error("LLM endpoint returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    // ── Normalisation ─────────────────────────────────────────────────────
    /// No JSON candidate could be located anywhere in the response.
    #[error("AI response structure invalid: no JSON payload found")]
    ResponseStructureInvalid,

    /// JSON parsed, but it is not one of the exam shapes we understand.
    #[error("Unexpected AI response shape: {detail}")]
    UnexpectedResponseShape { detail: String },

    /// The candidate text is not valid JSON.
    #[error("Failed to decode AI JSON ({detail})\nRaw JSON: {raw_text}")]
    JsonDecode { detail: String, raw_text: String },

    // ── Persistence ───────────────────────────────────────────────────────
    /// The answer-key document could not be rendered or written.
    #[error("Failed to render answer document: {0}")]
    ArtifactRender(String),

    /// The exam store rejected a read or write.
    #[error("Exam store error: {0}")]
    Persistence(String),

    // ── Scheduling ────────────────────────────────────────────────────────
    /// The host scheduler killed the run after its time budget.
    #[error("Job exceeded its {budget:?} time budget and was cancelled")]
    JobTimeout { budget: Duration },

    /// Unexpected internal error (task panic, invariant breach).
    #[error("Internal error: {0}")]
    Internal(String),
}

fn ocr_hint(image: &bool) -> &'static str {
    if *image {
        " (image uploads need OCR text)"
    } else {
        ""
    }
}

/// Coarse failure classes used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Storage,
    UnsupportedFormat,
    Extraction,
    Transport,
    Upstream,
    ResponseStructureInvalid,
    UnexpectedResponseShape,
    JsonDecode,
    ArtifactRender,
    Persistence,
    Timeout,
    Internal,
}

impl FailureKind {
    /// Whether the host scheduler may usefully run the job again.
    ///
    /// Malformed model output (`ResponseStructureInvalid`,
    /// `UnexpectedResponseShape`, `JsonDecode`) is terminal: the same prompt
    /// rarely produces a different reply.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Transport | FailureKind::Upstream | FailureKind::Timeout
        )
    }
}

impl IngestError {
    /// Classify this error for retry and reporting purposes.
    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::Configuration { .. } | IngestError::InvalidConfig(_) => {
                FailureKind::Configuration
            }
            IngestError::SourceMissing { .. }
            | IngestError::Storage { .. }
            | IngestError::UploadRejected { .. } => FailureKind::Storage,
            IngestError::UnsupportedFormat { .. } => FailureKind::UnsupportedFormat,
            IngestError::Extraction { .. } | IngestError::NoExtractableText { .. } => {
                FailureKind::Extraction
            }
            IngestError::Transport { .. } => FailureKind::Transport,
            IngestError::Upstream { .. } => FailureKind::Upstream,
            IngestError::ResponseStructureInvalid => FailureKind::ResponseStructureInvalid,
            IngestError::UnexpectedResponseShape { .. } => FailureKind::UnexpectedResponseShape,
            IngestError::JsonDecode { .. } => FailureKind::JsonDecode,
            IngestError::ArtifactRender(_) => FailureKind::ArtifactRender,
            IngestError::Persistence(_) => FailureKind::Persistence,
            IngestError::JobTimeout { .. } => FailureKind::Timeout,
            IngestError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Storage {
            path: path.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_is_not_retryable() {
        let e = IngestError::Configuration {
            detail: "no api key".into(),
        };
        assert_eq!(e.kind(), FailureKind::Configuration);
        assert!(!e.is_retryable());
    }

    #[test]
    fn upstream_display_and_retry() {
        let e = IngestError::Upstream {
            status: 503,
            body: "overloaded".into(),
        };
        assert!(e.to_string().contains("503"));
        assert!(e.to_string().contains("overloaded"));
        assert!(e.is_retryable());
    }

    #[test]
    fn malformed_output_and_artifact_failure_are_terminal() {
        let decode = IngestError::JsonDecode {
            detail: "EOF".into(),
            raw_text: "{".into(),
        };
        assert!(!decode.is_retryable());
        assert!(!IngestError::ResponseStructureInvalid.is_retryable());
        assert!(!FailureKind::UnexpectedResponseShape.is_retryable());
        assert!(decode.to_string().contains("Raw JSON: {"));

        let render = IngestError::ArtifactRender("disk full".into());
        assert!(!render.is_retryable());
    }

    #[test]
    fn no_text_display_mentions_ocr_for_images() {
        let e = IngestError::NoExtractableText {
            name: "paper.png".into(),
            image: true,
        };
        assert!(e.to_string().contains("OCR"));

        let e = IngestError::NoExtractableText {
            name: "paper.pdf".into(),
            image: false,
        };
        assert!(!e.to_string().contains("OCR"));
    }

    #[test]
    fn job_timeout_reports_sub_second_budgets() {
        let e = IngestError::JobTimeout {
            budget: Duration::from_millis(500),
        };
        assert!(e.to_string().contains("500ms"), "{e}");
        assert_eq!(e.kind(), FailureKind::Timeout);
    }

    #[test]
    fn unsupported_format_is_terminal() {
        let e = IngestError::UnsupportedFormat {
            name: "paper.txt".into(),
            extension: "txt".into(),
        };
        assert_eq!(e.kind(), FailureKind::UnsupportedFormat);
        assert!(!e.is_retryable());
    }
}
