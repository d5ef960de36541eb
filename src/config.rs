//! Configuration types for exam ingestion.
//!
//! All pipeline behaviour is controlled through [`IngestConfig`], built via
//! its [`IngestConfigBuilder`]. The LLM-facing subset is projected into a
//! [`GatewayConfig`] and injected into the gateway at construction, so no
//! stage of the pipeline reads the process environment on its own.
//!
//! # Design choice: builder over constructor
//! A dozen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on the
//! documented defaults for the rest.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default Gemini endpoint used when no endpoint is configured.
pub const DEFAULT_GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

/// Default OpenAI-compatible chat-completions endpoint.
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Upper bound on characters of extracted text embedded in one prompt.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 25_000;

/// Configuration for the ingestion pipeline and its worker pool.
///
/// Built via [`IngestConfig::builder()`] or [`IngestConfig::default()`].
///
/// # Example
/// ```rust
/// use exam_ingest::{IngestConfig, PromptVariant};
///
/// let config = IngestConfig::builder()
///     .api_key("secret")
///     .prompt_variant(PromptVariant::AnswerKey)
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 2);
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Wire protocol spoken by the endpoint. Default: [`Provider::Gemini`].
    pub provider: Provider,

    /// Completion endpoint URL. If None, the provider's default is used.
    pub endpoint: Option<String>,

    /// API credential. A run without one fails at the Calling stage with a
    /// configuration error; it is never retried.
    pub api_key: Option<String>,

    /// Model identifier sent in the body of OpenAI-compatible requests.
    /// Gemini encodes the model in the endpoint path instead. Default: "gpt-4.1-mini".
    pub model: String,

    /// Per-request timeout for the LLM call in seconds. Default: 180.
    ///
    /// Whole exam papers produce long completions; large models regularly
    /// need more than a minute. The bound still guarantees a stalled upstream
    /// cannot pin a worker forever.
    pub timeout_secs: u64,

    /// Which instruction template (and therefore which response shape) to use.
    /// Default: [`PromptVariant::QuestionSet`].
    pub prompt_variant: PromptVariant,

    /// Maximum characters of extracted text embedded in the prompt. Default: 25 000.
    ///
    /// Truncation is lossy: questions beyond the bound never reach the model.
    pub max_prompt_chars: usize,

    /// Number of jobs processed at once by the worker pool. Default: 4.
    pub concurrency: usize,

    /// Attempts per job, including the first. Default: 1 (no retry).
    ///
    /// Only retryable failure kinds are re-run; see
    /// [`crate::error::FailureKind::is_retryable`].
    pub max_attempts: u32,

    /// Base delay before a retry in milliseconds. Default: 500.
    ///
    /// Doubles on each further attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Wall-clock budget for one attempt of one job in seconds. Default: 300.
    ///
    /// Must exceed `timeout_secs`, otherwise the scheduler would kill runs
    /// that are still legitimately waiting for the model.
    pub job_timeout_secs: u64,

    /// Root directory of the file storage. Default: "storage".
    pub storage_root: PathBuf,

    /// SQLite database URL. Default: "sqlite://storage/exams.db".
    pub database_url: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            endpoint: None,
            api_key: None,
            model: "gpt-4.1-mini".to_string(),
            timeout_secs: 180,
            prompt_variant: PromptVariant::default(),
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
            concurrency: 4,
            max_attempts: 1,
            retry_backoff_ms: 500,
            job_timeout_secs: 300,
            storage_root: PathBuf::from("storage"),
            database_url: "sqlite://storage/exams.db".to_string(),
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("prompt_variant", &self.prompt_variant)
            .field("max_prompt_chars", &self.max_prompt_chars)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("job_timeout_secs", &self.job_timeout_secs)
            .field("storage_root", &self.storage_root)
            .field("database_url", &self.database_url)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Project the LLM-facing options into the gateway's configuration.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            endpoint: self
                .endpoint
                .clone()
                .unwrap_or_else(|| self.provider.default_endpoint().to_string()),
            api_key: self.api_key.clone(),
            timeout_secs: self.timeout_secs,
            prompt_variant: self.prompt_variant,
            provider: self.provider,
            model: self.model.clone(),
        }
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn provider(mut self, provider: Provider) -> Self {
        self.config.provider = provider;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn prompt_variant(mut self, variant: PromptVariant) -> Self {
        self.config.prompt_variant = variant;
        self
    }

    pub fn max_prompt_chars(mut self, n: usize) -> Self {
        self.config.max_prompt_chars = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn job_timeout_secs(mut self, secs: u64) -> Self {
        self.config.job_timeout_secs = secs;
        self
    }

    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "LLM timeout must be at least 1 second".into(),
            ));
        }
        if c.max_prompt_chars == 0 {
            return Err(IngestError::InvalidConfig(
                "max_prompt_chars must be ≥ 1".into(),
            ));
        }
        if c.job_timeout_secs <= c.timeout_secs {
            return Err(IngestError::InvalidConfig(format!(
                "job timeout ({}s) must exceed the LLM timeout ({}s)",
                c.job_timeout_secs, c.timeout_secs
            )));
        }
        if let Some(ref endpoint) = c.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(IngestError::InvalidConfig(format!(
                    "endpoint must be an http(s) URL, got '{endpoint}'"
                )));
            }
        }
        Ok(self.config)
    }
}

/// The options the LLM gateway needs, injected at construction.
#[derive(Clone)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub prompt_variant: PromptVariant,
    pub provider: Provider,
    pub model: String,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("prompt_variant", &self.prompt_variant)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish()
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Wire protocol of the completion endpoint.
///
/// The two envelopes differ in where the generated text lives; the
/// normaliser checks both paths regardless of which provider produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Google `generateContent`: key in the query string,
    /// text at `candidates[0].content.parts[0].text`.
    #[default]
    Gemini,
    /// OpenAI chat completions (and compatible servers): bearer token,
    /// text at `choices[0].message.content`.
    OpenAiCompatible,
}

impl Provider {
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Provider::Gemini => DEFAULT_GEMINI_ENDPOINT,
            Provider::OpenAiCompatible => DEFAULT_OPENAI_ENDPOINT,
        }
    }
}

/// Instruction template, each asking the model for a different JSON shape.
///
/// | Variant | Model returns |
/// |---------|---------------|
/// | `Flat` | one exam object with metadata only |
/// | `QuestionSet` | array of exams, each with a `questions` array (default) |
/// | `AnswerKey` | one exam object plus a consolidated `generatedAnswers` string |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    Flat,
    #[default]
    QuestionSet,
    AnswerKey,
}

impl PromptVariant {
    /// The top-level JSON shape this template asks for.
    pub fn response_shape(self) -> ResponseShape {
        match self {
            PromptVariant::QuestionSet => ResponseShape::ExamList,
            PromptVariant::Flat | PromptVariant::AnswerKey => ResponseShape::SingleExam,
        }
    }
}

/// Hint to the normaliser about which top-level shape to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    SingleExam,
    ExamList,
}
