//! CLI binary for edgequake-doctrans.
//!
//! A thin shim over the library crate: flags map onto `OcrConfig` and
//! `TranslationConfig`, results are printed as text or JSON.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_doctrans::{
    segment, ChatEndpoint, HeadingMode, OcrConfig, OcrPipeline, ProgressCallback, RenderConfig,
    RetryPolicy, Stage, StageProgressCallback, StageStats, StorageConfig, TranslationConfig,
    TranslationPipeline,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar per stage, one log line per finished unit.
/// Units finish out of order, so lines carry the unit's own position.
struct CliProgressCallback {
    /// Bar of the stage currently running.
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
        })
    }

    fn current(&self) -> Option<ProgressBar> {
        self.bar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn unit_noun(stage: Stage) -> &'static str {
        match stage {
            Stage::Upload | Stage::Ocr => "images",
            Stage::Translate | Stage::Polish => "chunks",
        }
    }
}

impl StageProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {}  \
             ⏱ {{elapsed_precise}}  ETA {{eta_precise}}",
            Self::unit_noun(stage)
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix(capitalise(&stage.to_string()));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total} {}…", Self::unit_noun(stage)))
        ));

        *self
            .bar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(bar);
    }

    fn on_unit_complete(&self, stage: Stage, index: usize, total: usize, output_len: usize) {
        if let Some(bar) = self.current() {
            bar.println(format!(
                "  {} {} {:>3}/{:<3}  {:<8}  {}",
                green("✓"),
                capitalise(&stage.to_string()),
                index + 1,
                total,
                dim(&format!("{output_len:>5} chars")),
                dim(&format!("{:.1}s", bar.elapsed().as_secs_f64())),
            ));
            bar.inc(1);
        }
    }

    fn on_unit_error(&self, stage: Stage, index: usize, total: usize, error: &str) {
        if let Some(bar) = self.current() {
            bar.println(format!(
                "  {} {} {:>3}/{:<3}  {}  {}",
                red("✗"),
                capitalise(&stage.to_string()),
                index + 1,
                total,
                red(&truncate(error, 80)),
                dim(&format!("{:.1}s", bar.elapsed().as_secs_f64())),
            ));
            bar.inc(1);
        }
    }

    fn on_stage_complete(&self, stage: Stage, total: usize, succeeded: usize) {
        if let Some(bar) = self
            .bar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            bar.finish_and_clear();
        }
        let failed = total.saturating_sub(succeeded);
        if failed == 0 {
            eprintln!(
                "{} {}: {} {} done",
                green("✔"),
                stage,
                bold(&succeeded.to_string()),
                Self::unit_noun(stage)
            );
        } else {
            eprintln!(
                "{} {}: {}/{} {} done  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                stage,
                bold(&succeeded.to_string()),
                total,
                Self::unit_noun(stage),
                red(&failed.to_string()),
            );
        }
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        let head: String = s.chars().take(max_chars - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # OCR a scanned book, two pages per image, images sent inline
  doctrans ocr book.pdf -o book.txt --model qwen-vl-max --keywords thermodynamics,entropy

  # OCR through an Aliyun OSS bucket (credentials from AWS_* variables).
  # OSS needs virtual-hosted addressing, with the bucket in the endpoint host.
  doctrans ocr book.pdf -o book.txt --model qwen-vl-max \
      --bucket scans --storage-endpoint https://scans.oss-cn-hangzhou.aliyuncs.com \
      --virtual-hosted --download-base-url https://scans.oss-cn-hangzhou.aliyuncs.com \
      --folder pdf_ocr

  # Crop running headers and footers before OCR
  doctrans ocr book.pdf -o book.txt --model qwen-vl-max --top-margin 120 --bottom-margin 90

  # Translate and polish the OCR output
  doctrans translate book.txt -o book.zh.txt --model qwen-max --polish-model qwen-max

  # Check how a text would be chunked before paying for translation
  doctrans segment book.txt --min-length 8000 --max-length 12000

ENVIRONMENT VARIABLES:
  DOCTRANS_BASE_URL       Full chat-completions URL (…/v1/chat/completions)
  DOCTRANS_API_KEY        Bearer credential for that endpoint
  DOCTRANS_MODEL          Default model for `ocr` and `translate`
  AWS_ACCESS_KEY_ID       Object store credentials (with --bucket)
  AWS_SECRET_ACCESS_KEY
  AWS_REGION
  RUST_LOG                Overrides the log filter (e.g. edgequake_doctrans=debug)

FAILURES:
  A unit that exhausts its retries does not stop the run. Its place in the
  output holds a marker line such as
    OCR failed for https://…/image_3.png: HTTP 502: bad gateway
    Translation failed for chunk 7: transport error: connection reset
  so the output stays aligned with the source document.
"#;

/// OCR scanned PDFs with vision LLMs, then translate and polish the text.
#[derive(Parser, Debug)]
#[command(
    name = "doctrans",
    version,
    about = "OCR scanned PDFs with vision LLMs, then translate and polish the text",
    long_about = "Rasterise scanned PDF pages, read them with a vision-capable chat-completion \
model, and translate the recovered text chunk by chunk. Works with any OpenAI-compatible \
endpoint (DashScope, vLLM, Ollama, LiteLLM, OpenAI, …).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output structured JSON instead of text.
    #[arg(long, global = true, env = "DOCTRANS_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, global = true, env = "DOCTRANS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCTRANS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCTRANS_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rasterise a PDF and OCR every page image.
    Ocr(OcrArgs),
    /// Segment a text file, translate every chunk and optionally polish it.
    Translate(TranslateArgs),
    /// Dry run: show how a text file would be chunked.
    Segment(SegmentArgs),
}

#[derive(Args, Debug)]
struct EndpointArgs {
    /// Full chat-completions URL.
    #[arg(long, env = "DOCTRANS_BASE_URL")]
    base_url: Option<String>,

    /// Bearer credential for the endpoint.
    #[arg(long, env = "DOCTRANS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model ID.
    #[arg(long, env = "DOCTRANS_MODEL")]
    model: Option<String>,

    /// Per-request timeout in seconds.
    #[arg(long, env = "DOCTRANS_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,
}

impl EndpointArgs {
    fn endpoint(&self) -> ChatEndpoint {
        ChatEndpoint::new(
            self.base_url.clone().unwrap_or_default(),
            self.api_key.clone().unwrap_or_default(),
        )
        .request_timeout_secs(self.api_timeout)
    }

    fn model(&self) -> String {
        self.model.clone().unwrap_or_default()
    }
}

#[derive(Args, Debug)]
struct OcrArgs {
    /// Scanned PDF file.
    input: PathBuf,

    /// Write the OCR text to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Comma-separated domain keywords included in the OCR prompt.
    #[arg(long, env = "DOCTRANS_KEYWORDS", value_delimiter = ',')]
    keywords: Vec<String>,

    /// Text file replacing the default OCR prompt.
    #[arg(long, env = "DOCTRANS_OCR_PROMPT")]
    prompt_file: Option<PathBuf>,

    /// Consecutive pages stitched into one image.
    #[arg(long, env = "DOCTRANS_PAGES_PER_IMAGE", default_value_t = 2)]
    pages_per_image: usize,

    /// Longest side of a rendered page, in pixels.
    #[arg(long, env = "DOCTRANS_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// Pixels cut from the top of every page (disables auto trimming).
    #[arg(long)]
    top_margin: Option<u32>,

    /// Pixels cut from the bottom of every page (disables auto trimming).
    #[arg(long)]
    bottom_margin: Option<u32>,

    /// Keep blank rows at the top and bottom of pages.
    #[arg(long)]
    no_trim: bool,

    /// PDF user password.
    #[arg(long, env = "DOCTRANS_PDF_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Also save the rendered images into this directory.
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Concurrent OCR calls.
    #[arg(short, long, env = "DOCTRANS_OCR_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Attempts per OCR request (inner layer).
    #[arg(long, default_value_t = 5)]
    call_retries: u32,

    /// Attempts of the whole retried OCR call (outer layer).
    #[arg(long, default_value_t = 5)]
    outer_retries: u32,

    /// Keep OCR text exactly as returned (no fence or whitespace cleanup).
    #[arg(long)]
    raw: bool,

    /// Upload images to this bucket instead of sending them inline.
    #[arg(long, env = "DOCTRANS_BUCKET", requires = "download_base_url")]
    bucket: Option<String>,

    /// S3-compatible endpoint (Aliyun OSS, MinIO, …).
    #[arg(long, env = "DOCTRANS_STORAGE_ENDPOINT")]
    storage_endpoint: Option<String>,

    /// Public URL prefix under which uploaded objects are readable.
    #[arg(long, env = "DOCTRANS_DOWNLOAD_BASE_URL")]
    download_base_url: Option<String>,

    /// Put the bucket in the host name (`{bucket}.{endpoint}`) rather than
    /// the path. Required by Aliyun OSS; the endpoint must include the bucket.
    #[arg(long, env = "DOCTRANS_VIRTUAL_HOSTED")]
    virtual_hosted: bool,

    /// Object name prefix inside the bucket.
    #[arg(long, env = "DOCTRANS_FOLDER")]
    folder: Option<String>,

    /// Concurrent uploads.
    #[arg(long, env = "DOCTRANS_UPLOAD_WORKERS", default_value_t = 1)]
    upload_workers: usize,
}

#[derive(Args, Debug)]
struct ChunkingArgs {
    /// Minimum chunk length in characters.
    #[arg(long, env = "DOCTRANS_MIN_LENGTH", default_value_t = 8000)]
    min_length: usize,

    /// Maximum chunk length in characters.
    #[arg(long, env = "DOCTRANS_MAX_LENGTH", default_value_t = 12000)]
    max_length: usize,

    /// Split at any Markdown heading, not only numbered ones.
    #[arg(long)]
    any_heading: bool,
}

impl ChunkingArgs {
    fn heading_mode(&self) -> HeadingMode {
        if self.any_heading {
            HeadingMode::Any
        } else {
            HeadingMode::Numbered
        }
    }
}

#[derive(Args, Debug)]
struct TranslateArgs {
    /// UTF-8 text file, usually the output of `doctrans ocr`.
    input: PathBuf,

    /// Write the translation to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(flatten)]
    endpoint: EndpointArgs,

    #[command(flatten)]
    chunking: ChunkingArgs,

    /// Model used for the polishing pass; polishing is skipped when unset.
    #[arg(long, env = "DOCTRANS_POLISH_MODEL")]
    polish_model: Option<String>,

    /// Target language named in the default prompts.
    #[arg(short, long, env = "DOCTRANS_LANGUAGE", default_value = "Chinese")]
    language: String,

    /// Text file replacing the default translation prompt.
    #[arg(long)]
    translation_prompt: Option<PathBuf>,

    /// Text file replacing the default polishing prompt.
    #[arg(long)]
    polishing_prompt: Option<PathBuf>,

    /// Concurrent translation calls.
    #[arg(short, long, env = "DOCTRANS_TRANSLATE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Attempts per translation or polishing request.
    #[arg(long, default_value_t = 8)]
    retries: u32,

    /// Seconds between attempts.
    #[arg(long, default_value_t = 2)]
    retry_delay: u64,
}

#[derive(Args, Debug)]
struct SegmentArgs {
    /// UTF-8 text file.
    input: PathBuf,

    #[command(flatten)]
    chunking: ChunkingArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // With a progress bar active only errors are logged; the bar carries
    // per-unit feedback.
    let is_dry_run = matches!(cli.command, Command::Segment(_));
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !is_dry_run;
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

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn StageProgressCallback>)
    } else {
        None
    };

    match &cli.command {
        Command::Ocr(args) => run_ocr_command(&cli, args, progress).await,
        Command::Translate(args) => run_translate_command(&cli, args, progress).await,
        Command::Segment(args) => run_segment_command(&cli, args).await,
    }
}

// ── ocr ──────────────────────────────────────────────────────────────────────

async fn run_ocr_command(
    cli: &Cli,
    args: &OcrArgs,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    let config = build_ocr_config(args).await?;
    let mut pipeline = OcrPipeline::new(config).context("Failed to set up OCR pipeline")?;
    if let Some(cb) = progress {
        pipeline = pipeline.with_progress(cb);
    }

    let output = pipeline
        .run(&args.input, args.output.as_deref())
        .await
        .context("OCR failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialise output")?
        );
    } else if args.output.is_none() {
        write_stdout(&output.text())?;
    }

    if !cli.quiet && !cli.json {
        if let Some(upload) = &output.upload {
            print_stage_summary(upload);
        }
        print_stage_summary(&output.ocr);
        if let Some(path) = &output.output_path {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }
    Ok(())
}

/// Map `ocr` flags to `OcrConfig`.
async fn build_ocr_config(args: &OcrArgs) -> Result<OcrConfig> {
    let prompt = read_optional(args.prompt_file.as_ref()).await?;

    let render = RenderConfig {
        max_rendered_pixels: args.max_pixels,
        pages_per_image: args.pages_per_image,
        top_margin: args.top_margin,
        bottom_margin: args.bottom_margin,
        trim_blank_rows: !args.no_trim,
        password: args.password.clone(),
        image_dir: args.image_dir.clone(),
    };

    let defaults = OcrConfig::default();
    let mut builder = OcrConfig::builder()
        .endpoint(args.endpoint.endpoint())
        .model(args.endpoint.model())
        .keywords(args.keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()))
        .max_workers(args.workers)
        .call_retry(RetryPolicy::new(args.call_retries, defaults.call_retry.delay))
        .outer_retry(RetryPolicy::new(args.outer_retries, defaults.outer_retry.delay))
        .render(render)
        .clean_output(!args.raw);

    if let Some(prompt) = prompt {
        builder = builder.prompt(prompt);
    }

    if let (Some(bucket), Some(base)) = (&args.bucket, &args.download_base_url) {
        let mut storage = StorageConfig::new(bucket, base)
            .max_workers(args.upload_workers)
            .virtual_hosted_style(args.virtual_hosted);
        if let Some(endpoint) = &args.storage_endpoint {
            storage = storage.endpoint(endpoint);
        }
        if let Some(folder) = &args.folder {
            storage = storage.folder(folder);
        }
        builder = builder.storage(storage);
    }

    builder.build().context("Invalid OCR configuration")
}

// ── translate ────────────────────────────────────────────────────────────────

async fn run_translate_command(
    cli: &Cli,
    args: &TranslateArgs,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    let config = build_translation_config(args).await?;
    let mut pipeline =
        TranslationPipeline::new(config).context("Failed to set up translation pipeline")?;
    if let Some(cb) = progress {
        pipeline = pipeline.with_progress(cb);
    }

    let output = pipeline
        .run(&args.input, args.output.as_deref())
        .await
        .context("Translation failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialise output")?
        );
    } else if args.output.is_none() {
        write_stdout(&output.text())?;
    }

    if !cli.quiet && !cli.json {
        print_stage_summary(&output.translate);
        if let Some(polish) = &output.polish {
            print_stage_summary(polish);
        }
        if let Some(path) = &output.output_path {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }
    Ok(())
}

/// Map `translate` flags to `TranslationConfig`.
async fn build_translation_config(args: &TranslateArgs) -> Result<TranslationConfig> {
    let translation_prompt = read_optional(args.translation_prompt.as_ref()).await?;
    let polishing_prompt = read_optional(args.polishing_prompt.as_ref()).await?;

    let mut builder = TranslationConfig::builder()
        .endpoint(args.endpoint.endpoint())
        .model(args.endpoint.model())
        .lengths(args.chunking.min_length, args.chunking.max_length)
        .heading_mode(args.chunking.heading_mode())
        .target_language(&args.language)
        .max_workers(args.workers)
        .retry(RetryPolicy::new(
            args.retries,
            Duration::from_secs(args.retry_delay),
        ));

    if let Some(model) = &args.polish_model {
        builder = builder.polishing_model(model);
    }
    if let Some(prompt) = translation_prompt {
        builder = builder.translation_prompt(prompt);
    }
    if let Some(prompt) = polishing_prompt {
        builder = builder.polishing_prompt(prompt);
    }

    builder.build().context("Invalid translation configuration")
}

// ── segment ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChunkSummary<'a> {
    ordinal: usize,
    chars: usize,
    heading: &'a str,
}

async fn run_segment_command(cli: &Cli, args: &SegmentArgs) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;

    let c = &args.chunking;
    let chunks = segment(&text, c.min_length, c.max_length, c.heading_mode())
        .context("Segmentation failed")?;

    let summaries: Vec<ChunkSummary<'_>> = chunks
        .iter()
        .map(|chunk| ChunkSummary {
            ordinal: chunk.ordinal,
            chars: chunk.text.chars().count(),
            heading: chunk.text.lines().next().unwrap_or_default().trim(),
        })
        .collect();

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summaries).context("Failed to serialise chunks")?
        );
        return Ok(());
    }

    println!(
        "{} chunks  ({}–{} chars, {:?} headings)",
        bold(&chunks.len().to_string()),
        c.min_length,
        c.max_length,
        c.heading_mode()
    );
    for s in &summaries {
        let size = format!("{:>6} chars", s.chars);
        let size = if s.chars > c.max_length {
            red(&size)
        } else {
            dim(&size)
        };
        println!("  {:>4}  {}  {}", s.ordinal, size, truncate(s.heading, 60));
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

async fn read_optional(path: Option<&PathBuf>) -> Result<Option<String>> {
    match path {
        Some(path) => Ok(Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read prompt from {:?}", path))?,
        )),
        None => Ok(None),
    }
}

fn write_stdout(text: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(text.as_bytes())
        .context("Failed to write to stdout")?;
    handle.flush().context("Failed to flush stdout")
}

fn print_stage_summary(stats: &StageStats) {
    eprintln!(
        "{}  {}  {}/{}  {}ms",
        if stats.failed == 0 {
            green("✔")
        } else {
            cyan("⚠")
        },
        stats.stage,
        stats.succeeded,
        stats.total,
        stats.duration_ms,
    );
}
