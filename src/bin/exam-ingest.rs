//! CLI binary for exam-ingest.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `IngestConfig`, runs the worker pool and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use exam_ingest::store::DEFAULT_PER_PAGE;
use exam_ingest::{
    ExamStore, HttpGateway, IngestConfig, IngestProgressCallback, JobContext, JobOutcome,
    JobStatus, ProgressCallback, PromptVariant, Provider, SqliteExamStore, Stage, StoredExam,
    UploadedDocument, WorkerPool,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

fn shorten(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch plus a log line per
/// finished job. Jobs finish out of order when concurrency > 1.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} papers  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Ingesting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_jobs: usize) {
        self.bar.set_length(total_jobs as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Ingesting {total_jobs} paper(s)…"))
        ));
    }

    fn on_job_start(&self, original_name: &str, attempt: u32) {
        if attempt > 1 {
            self.bar.println(format!(
                "  {} {}  {}",
                yellow("↻"),
                original_name,
                dim(&format!("attempt {attempt}"))
            ));
        }
    }

    fn on_stage(&self, original_name: &str, stage: Stage) {
        self.bar
            .set_message(format!("{}: {}", shorten(original_name, 30), stage));
    }

    fn on_job_failed(&self, original_name: &str, stage: Stage, error: &str, will_retry: bool) {
        if will_retry {
            self.bar.println(format!(
                "  {} {}  {} {}",
                yellow("!"),
                original_name,
                dim(&format!("{stage}:")),
                yellow(&shorten(error, 80))
            ));
        }
    }

    fn on_job_complete(&self, outcome: &JobOutcome) {
        let secs = dim(&format!("{:.1}s", outcome.duration_ms as f64 / 1000.0));
        let line = match &outcome.status {
            JobStatus::Completed {
                exam_ids,
                questions,
            } => format!(
                "  {} {}  {}  {}",
                green("✓"),
                outcome.original_name,
                dim(&format!("{} exam(s), {} question(s)", exam_ids.len(), questions)),
                secs
            ),
            JobStatus::Duplicate => format!(
                "  {} {}  {}  {}",
                cyan("="),
                outcome.original_name,
                dim("already ingested"),
                secs
            ),
            JobStatus::Failed { stage, message, .. } => format!(
                "  {} {}  {} {}  {}",
                red("✗"),
                outcome.original_name,
                dim(&format!("{stage}:")),
                red(&shorten(message, 80)),
                secs
            ),
        };
        self.bar.println(line);
        if !outcome.skipped.is_empty() {
            self.bar.println(format!(
                "    {}",
                yellow(&format!("{} question(s) skipped", outcome.skipped.len()))
            ));
        }
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_jobs: usize, success_count: usize) {
        let failed = total_jobs.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} paper(s) ingested successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} paper(s) ingested  ({} failed)",
                if failed == total_jobs {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_jobs,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest a PDF and a DOCX with the default Gemini endpoint
  exam-ingest ingest paper1.pdf paper2.docx

  # Ask for an answer key and render it to a PDF
  exam-ingest ingest --variant answer-key maths.pdf

  # Use an OpenAI-compatible server
  exam-ingest ingest --provider openai --model gpt-4.1-mini paper.pdf

  # Retry transient upstream failures twice more
  exam-ingest ingest --max-attempts 3 *.pdf

  # List stored exams, newest first
  exam-ingest list --page 2
  exam-ingest list --json

PROMPT VARIANTS:
  question-set  (default) array of exams with numbered questions and answers
  flat          exam metadata only
  answer-key    exam metadata plus a consolidated answer key rendered to PDF

SUPPORTED UPLOADS:
  pdf, docx     text extracted locally
  jpg, jpeg, png
                stored publicly; needs a text recogniser to produce text

ENVIRONMENT VARIABLES:
  EXAM_INGEST_API_KEY     API key for the completion endpoint
  GEMINI_API_KEY          Used when EXAM_INGEST_API_KEY is not set
  EXAM_INGEST_PROVIDER    gemini or openai
  EXAM_INGEST_ENDPOINT    Override the endpoint URL
  EXAM_INGEST_MODEL       Model ID for OpenAI-compatible endpoints
  EXAM_INGEST_STORAGE     Storage root (default: storage)
  EXAM_INGEST_DATABASE    SQLite URL (default: sqlite://storage/exams.db)
  RUST_LOG                Overrides --verbose/--quiet log filtering
"#;

/// Turn exam papers into structured exam records using an LLM.
#[derive(Parser, Debug)]
#[command(
    name = "exam-ingest",
    version,
    about = "Turn exam papers (PDF, DOCX, images) into structured exam records using an LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory for uploads, images and answer keys.
    #[arg(long, global = true, env = "EXAM_INGEST_STORAGE", default_value = "storage")]
    storage: PathBuf,

    /// SQLite database URL.
    #[arg(long, global = true, env = "EXAM_INGEST_DATABASE")]
    database: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EXAM_INGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EXAM_INGEST_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload and process one or more exam papers.
    Ingest(IngestArgs),
    /// List stored exams, newest first.
    List(ListArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Exam papers to ingest (.pdf, .docx, .jpg, .jpeg, .png).
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// API key for the completion endpoint.
    #[arg(long, env = "EXAM_INGEST_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Wire protocol of the endpoint.
    #[arg(long, env = "EXAM_INGEST_PROVIDER", value_enum, default_value = "gemini")]
    provider: ProviderArg,

    /// Endpoint URL; defaults to the provider's public endpoint.
    #[arg(long, env = "EXAM_INGEST_ENDPOINT")]
    endpoint: Option<String>,

    /// Model ID for OpenAI-compatible endpoints.
    #[arg(long, env = "EXAM_INGEST_MODEL")]
    model: Option<String>,

    /// Instruction template to use.
    #[arg(long, env = "EXAM_INGEST_VARIANT", value_enum, default_value = "question-set")]
    variant: VariantArg,

    /// Number of papers processed at once.
    #[arg(short, long, env = "EXAM_INGEST_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Attempts per paper for retryable failures.
    #[arg(long, env = "EXAM_INGEST_MAX_ATTEMPTS", default_value_t = 1)]
    max_attempts: u32,

    /// LLM request timeout in seconds.
    #[arg(long, env = "EXAM_INGEST_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// Wall-clock budget per attempt in seconds.
    #[arg(long, env = "EXAM_INGEST_JOB_TIMEOUT", default_value_t = 300)]
    job_timeout: u64,

    /// Maximum characters of extracted text sent to the model.
    #[arg(long, env = "EXAM_INGEST_MAX_PROMPT_CHARS", default_value_t = 25_000)]
    max_prompt_chars: usize,

    /// Print job outcomes as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "EXAM_INGEST_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    page: u32,

    /// Exams per page.
    #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
    per_page: u32,

    /// Print the page as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ProviderArg {
    Gemini,
    Openai,
}

impl From<ProviderArg> for Provider {
    fn from(v: ProviderArg) -> Self {
        match v {
            ProviderArg::Gemini => Provider::Gemini,
            ProviderArg::Openai => Provider::OpenAiCompatible,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum VariantArg {
    Flat,
    QuestionSet,
    AnswerKey,
}

impl From<VariantArg> for PromptVariant {
    fn from(v: VariantArg) -> Self {
        match v {
            VariantArg::Flat => PromptVariant::Flat,
            VariantArg::QuestionSet => PromptVariant::QuestionSet,
            VariantArg::AnswerKey => PromptVariant::AnswerKey,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs are noise while the progress bar is drawing.
    let show_progress = match &cli.command {
        Command::Ingest(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::List(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Ingest(args) => ingest(&cli, args, show_progress).await,
        Command::List(args) => list(&cli, args).await,
    }
}

async fn ingest(cli: &Cli, args: &IngestArgs, show_progress: bool) -> Result<()> {
    let config = build_config(cli, args)?;
    let store = open_store(&config).await?;
    let gateway =
        HttpGateway::new(config.gateway_config()).context("Failed to build HTTP client")?;

    let mut ctx = JobContext::new(&config, store, Arc::new(gateway));
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        ctx = ctx.with_progress(cb);
    }

    // ── Accept uploads ───────────────────────────────────────────────────
    let mut docs: Vec<UploadedDocument> = Vec::with_capacity(args.files.len());
    let mut rejected = 0usize;
    for path in &args.files {
        let name = original_name(path);
        match ctx.storage.accept_upload(path, &name).await {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                rejected += 1;
                if !cli.quiet {
                    eprintln!("{} {}  {}", red("✗"), name, red(&e.to_string()));
                }
            }
        }
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let pool = WorkerPool::new(ctx, &config);
    let outcomes = pool.run_all(docs).await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcomes).context("Failed to serialise outcomes")?
        );
    } else if !cli.quiet && !show_progress {
        for outcome in &outcomes {
            match &outcome.status {
                JobStatus::Completed {
                    exam_ids,
                    questions,
                } => eprintln!(
                    "{}: {} exam(s), {} question(s) in {}ms",
                    outcome.original_name,
                    exam_ids.len(),
                    questions,
                    outcome.duration_ms
                ),
                JobStatus::Duplicate => {
                    eprintln!("{}: already ingested", outcome.original_name)
                }
                JobStatus::Failed { stage, message, .. } => {
                    eprintln!("{}: failed while {}: {}", outcome.original_name, stage, message)
                }
            }
        }
    }

    let failed = outcomes.iter().filter(|o| !o.is_success()).count() + rejected;
    if failed > 0 {
        anyhow::bail!("{} of {} paper(s) failed", failed, args.files.len());
    }
    Ok(())
}

async fn list(cli: &Cli, args: &ListArgs) -> Result<()> {
    let config = IngestConfig::builder()
        .storage_root(&cli.storage)
        .database_url(database_url(cli))
        .build()
        .context("Invalid configuration")?;
    let store = open_store(&config).await?;
    let page = store
        .list_exams(args.page, args.per_page)
        .await
        .context("Failed to list exams")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&page).context("Failed to serialise exams")?
        );
        return Ok(());
    }

    if page.exams.is_empty() {
        println!("No exams on page {}.", page.page);
        return Ok(());
    }
    for exam in &page.exams {
        print_exam(exam);
    }
    println!(
        "{}",
        dim(&format!(
            "Page {}/{} ({} exam(s))",
            page.page,
            page.last_page(),
            page.total
        ))
    );
    Ok(())
}

fn print_exam(exam: &StoredExam) {
    let r = &exam.record;
    let details: Vec<String> = [
        r.subject.clone(),
        r.class.clone(),
        r.term.map(|t| format!("term {t}")),
        r.year.clone(),
        r.curriculum.clone(),
        r.exam_type.clone(),
    ]
    .into_iter()
    .flatten()
    .collect();

    println!(
        "{} {}  {}  {}",
        cyan(&format!("#{}", exam.id)),
        bold(&r.exam_name),
        dim(&details.join(", ")),
        dim(&exam.created_at.format("%Y-%m-%d %H:%M").to_string())
    );
    if let Some(ref examiner) = r.examiner {
        println!("     examiner: {examiner}");
    }
    for q in &r.questions {
        let sub_part = q.question_sub_part.as_deref().unwrap_or("");
        let label = format!("{}{}.", q.question_number, sub_part);
        println!(
            "     {:<6}{}  →  {}",
            label,
            shorten(&q.question_text, 60),
            shorten(&q.answer_text, 40)
        );
        if let Some(ref image) = q.image_ref {
            println!("           {}", dim(&format!("image: {image}")));
        }
    }
    if let Some(ref answers) = r.answers_artifact_ref {
        println!("     answers: {answers}");
    }
    if let Some(ref image) = r.image_ref {
        println!("     image: {image}");
    }
}

/// Map CLI args to `IngestConfig`.
fn build_config(cli: &Cli, args: &IngestArgs) -> Result<IngestConfig> {
    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("GEMINI_API_KEY").ok());

    let mut builder = IngestConfig::builder()
        .provider(args.provider.clone().into())
        .prompt_variant(args.variant.clone().into())
        .timeout_secs(args.api_timeout)
        .job_timeout_secs(args.job_timeout)
        .max_prompt_chars(args.max_prompt_chars)
        .concurrency(args.concurrency)
        .max_attempts(args.max_attempts)
        .storage_root(&cli.storage)
        .database_url(database_url(cli));

    if let Some(key) = api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref endpoint) = args.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }

    builder.build().context("Invalid configuration")
}

fn database_url(cli: &Cli) -> String {
    cli.database
        .clone()
        .unwrap_or_else(|| format!("sqlite://{}", cli.storage.join("exams.db").display()))
}

async fn open_store(config: &IngestConfig) -> Result<Arc<dyn ExamStore>> {
    let parent = sqlite_file(&config.database_url)
        .and_then(|file| file.parent().map(Path::to_path_buf));
    if let Some(parent) = parent {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let store = SqliteExamStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    Ok(Arc::new(store))
}

/// File path of a `sqlite:` URL, or None for in-memory databases.
fn sqlite_file(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

fn original_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
