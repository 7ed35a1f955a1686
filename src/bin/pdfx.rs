//! CLI binary for edgequake-pdf-extract.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs the pipeline, and prints the result as Markdown
//! or JSON.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf_extract::pipeline::input::resolve_input;
use edgequake_pdf_extract::pipeline::vision::DEFAULT_OCR_MODEL;
use edgequake_pdf_extract::{
    cancellation, inspect, ExtractError, ExtractionProgressCallback, ExtractionResult,
    ExtractionStats, PageSelection, PageSeparator, Pipeline, PipelineConfig, TablePolicy,
    TimeoutPolicy, VisionOcrEngine,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages are reported in page
/// order; page starts arrive from concurrent tasks.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    issues: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Splitting PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            issues: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&page_num))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(page_num, Instant::now());
        }
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, items: usize) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<10}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{items:>4} items")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_issue(&self, page_num: usize, total: usize, issue: &str) {
        self.issues.fetch_add(1, Ordering::SeqCst);
        let msg: String = if issue.chars().count() > 80 {
            format!("{}\u{2026}", issue.chars().take(79).collect::<String>())
        } else {
            issue.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            yellow("⚠"),
            page_num,
            total,
            yellow(&msg),
        ));
    }

    fn on_extraction_complete(&self, total_pages: usize, completed_pages: usize) {
        self.bar.finish_and_clear();
        let issues = self.issues.load(Ordering::SeqCst);
        if completed_pages == total_pages && issues == 0 {
            eprintln!(
                "{} {} pages extracted",
                green("✔"),
                bold(&completed_pages.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages extracted  ({} page issues)",
                yellow("⚠"),
                bold(&completed_pages.to_string()),
                total_pages,
                issues,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Prompt-ready Markdown on stdout
  pdfx report.pdf

  # Full structured result (items, sources, confidences, issues)
  pdfx report.pdf --format json -o report.json

  # Specific pages, tables decided by confidence instead of precedence
  pdfx --pages 3-15 --table-policy confidence-first report.pdf

  # OCR charts and scanned figures with a vision LLM
  pdfx --ocr-provider openai --ocr-model gpt-4.1-mini report.pdf

  # Inspect PDF metadata only
  pdfx --inspect-only report.pdf

  # Start from a JSON config file, override one value
  pdfx --config pdfx.json --concurrency 8 report.pdf

Ctrl-C stops the run; the pages finished so far are still written, and the
result is marked cancelled.

BUILT-IN EXTRACTORS (default precedence order):
  ruled-tables     tables from stroked ruling lines
  aligned-tables   tables from column-aligned text
  text-layer       text lines from the content stream
  embedded-images  image XObjects with structure hints

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (OCR)
  ANTHROPIC_API_KEY       Anthropic API key (OCR)
  GEMINI_API_KEY          Google Gemini API key (OCR)
  EDGEQUAKE_LLM_PROVIDER  OCR provider when --ocr is given without a provider
  EDGEQUAKE_MODEL         OCR model for that provider
  RUST_LOG                Log filter (overrides -v / -q)
"#;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Markdown,
    Json,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TablePolicyArg {
    PrecedenceFirst,
    ConfidenceFirst,
}

impl From<TablePolicyArg> for TablePolicy {
    fn from(v: TablePolicyArg) -> Self {
        match v {
            TablePolicyArg::PrecedenceFirst => TablePolicy::PrecedenceFirst,
            TablePolicyArg::ConfidenceFirst => TablePolicy::ConfidenceFirst,
        }
    }
}

/// Extract text, tables and images from PDFs into confidence-scored output.
#[derive(Parser, Debug)]
#[command(
    name = "pdfx",
    version,
    about = "Extract text, tables and images from PDFs into confidence-scored output",
    long_about = "Runs several independent extractors over every page of a PDF, fuses what \
they report into one deduplicated set of text blocks, tables and images, and scores how far \
each can be trusted. Output is prompt-ready Markdown or the full JSON result.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path.
    input: PathBuf,

    /// Write output to this file instead of stdout.
    #[arg(short, long, env = "PDFX_OUTPUT")]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(long, env = "PDFX_FORMAT", value_enum, default_value = "markdown")]
    format: OutputFormat,

    /// JSON file with a PipelineConfig; flags below override it.
    #[arg(long, env = "PDFX_CONFIG")]
    config: Option<PathBuf>,

    /// Pages processed at the same time.
    #[arg(short, long, env = "PDFX_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PDFX_PAGES")]
    pages: Option<String>,

    /// IoU above which overlapping fragments are merged (0–1).
    #[arg(long, env = "PDFX_IOU")]
    iou: Option<f32>,

    /// How conflicting table grids are resolved.
    #[arg(long, env = "PDFX_TABLE_POLICY", value_enum)]
    table_policy: Option<TablePolicyArg>,

    /// Comma-separated extractor precedence, most trusted first.
    #[arg(long, env = "PDFX_PRECEDENCE")]
    precedence: Option<String>,

    /// Image confidence above which an image is sent to OCR (0–1).
    #[arg(long, env = "PDFX_OCR_TRIGGER")]
    ocr_trigger: Option<f32>,

    /// Fixed per-call extractor/OCR timeout in milliseconds (default: derived
    /// from the page count).
    #[arg(long, env = "PDFX_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Page separator for Markdown: none, hr, comment, or custom string.
    #[arg(long, env = "PDFX_SEPARATOR")]
    separator: Option<String>,

    /// Prepend YAML front matter to Markdown output.
    #[arg(long, env = "PDFX_METADATA")]
    metadata: bool,

    /// Enable OCR with a provider auto-detected from the environment.
    #[arg(long, env = "PDFX_OCR")]
    ocr: bool,

    /// Vision LLM provider for OCR (implies --ocr).
    #[arg(long, env = "PDFX_OCR_PROVIDER")]
    ocr_provider: Option<String>,

    /// Vision LLM model for OCR.
    #[arg(long, env = "PDFX_OCR_MODEL")]
    ocr_model: Option<String>,

    /// Sampling temperature for OCR calls (0.0–2.0).
    #[arg(long, env = "PDFX_OCR_TEMPERATURE")]
    ocr_temperature: Option<f32>,

    /// Max output tokens per OCR call.
    #[arg(long, env = "PDFX_OCR_MAX_TOKENS")]
    ocr_max_tokens: Option<usize>,

    /// Retries per OCR call on transient provider errors.
    #[arg(long, env = "PDFX_OCR_MAX_RETRIES")]
    ocr_max_retries: Option<u32>,

    /// Initial retry backoff in milliseconds (doubles each attempt).
    #[arg(long, env = "PDFX_OCR_RETRY_BACKOFF_MS")]
    ocr_retry_backoff_ms: Option<u64>,

    /// Disable progress bar.
    #[arg(long, env = "PDFX_NO_PROGRESS")]
    no_progress: bool,

    /// Print PDF metadata only, no extraction.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFX_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar gives all the feedback that matters; keep library
    // INFO logs out of its way unless asked.
    let writes_stdout_json = cli.output.is_none() && cli.format == OutputFormat::Json;
    let show_progress = !cli.quiet && !cli.no_progress && !writes_stdout_json;
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

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&cli.input).await.context("Failed to inspect PDF")?;

        if cli.format == OutputFormat::Json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            println!("File:         {}", cli.input.display());
            if let Some(ref t) = meta.title {
                println!("Title:        {}", t);
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {}", a);
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            println!("Size:         {} bytes", meta.source_byte_length);
        }
        return Ok(());
    }

    // ── Build pipeline ───────────────────────────────────────────────────
    let progress_cb: Option<Arc<dyn ExtractionProgressCallback>> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;
    let pipeline = build_pipeline(&cli, config)?;

    // ── Run, with Ctrl-C as cancellation ────────────────────────────────
    let resolved = resolve_input(&cli.input)
        .await
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;

    let (handle, token) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Cancelling… finished pages will still be written", yellow("⚠"));
            handle.cancel();
        }
    });

    let (result, stats) = match pipeline.extract_with_cancel(&resolved.bytes, token).await {
        Ok(output) => (output.result, Some(output.stats)),
        Err(ExtractError::Cancelled { partial }) => (*partial, None),
        Err(e) => return Err(e).context("Extraction failed"),
    };

    // ── Emit ─────────────────────────────────────────────────────────────
    let body = match cli.format {
        OutputFormat::Json => result.to_json().context("Failed to serialise result")?,
        OutputFormat::Markdown => {
            let cfg = pipeline.config();
            result.to_markdown(&cfg.page_separator, cfg.include_metadata)
        }
    };

    match cli.output {
        Some(ref path) => write_atomic(path, &body).await?,
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(body.as_bytes())
                .context("Failed to write to stdout")?;
            if !body.ends_with('\n') {
                handle.write_all(b"\n").ok();
            }
        }
    }

    if !cli.quiet {
        print_summary(&result, stats.as_ref(), cli.output.as_deref());
    }

    if result.cancelled {
        std::process::exit(130);
    }
    Ok(())
}

fn print_summary(result: &ExtractionResult, stats: Option<&ExtractionStats>, output: Option<&Path>) {
    let q = &result.quality;
    let fmt_score = |s: Option<f32>| s.map_or_else(|| "–".to_string(), |v| format!("{v:.2}"));
    eprintln!(
        "{}  fidelity {}  text {}  tables {}  images {}  {} items  {} issues{}",
        if q.needs_fallback { yellow("⚠") } else { green("✔") },
        bold(&format!("{:.2}", q.overall_fidelity)),
        fmt_score(q.scores.text_confidence),
        fmt_score(q.scores.table_accuracy),
        fmt_score(q.scores.image_relevance),
        result.items.len(),
        q.issues.len(),
        output.map_or_else(String::new, |p| format!("  →  {}", bold(&p.display().to_string()))),
    );
    if let Some(s) = stats {
        eprintln!(
            "   {}",
            dim(&format!(
                "{} extractor calls ({} failed), {} OCR calls ({} failed), {}ms total",
                s.extractor_calls, s.extractor_failures, s.ocr_calls, s.ocr_failures, s.total_duration_ms
            ))
        );
    }
    if result.cancelled {
        eprintln!(
            "   {}",
            yellow(&format!(
                "cancelled after {}/{} pages",
                result.metadata.pages_processed, result.metadata.pages_selected
            ))
        );
    }
}

/// Write via a temp file and rename so a crash never leaves half a file.
async fn write_atomic(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("pdfx.tmp");
    tokio::fs::write(&tmp_path, body)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move output into {}", path.display()))?;
    Ok(())
}

/// Map CLI args onto `PipelineConfig`, starting from `--config` if given.
async fn build_config(
    cli: &Cli,
    progress: Option<Arc<dyn ExtractionProgressCallback>>,
) -> Result<PipelineConfig> {
    let base = match cli.config {
        Some(ref path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            PipelineConfig::from_json(&json).context("Invalid config file")?
        }
        None => PipelineConfig::default(),
    };

    let mut builder = base.to_builder();
    if let Some(n) = cli.concurrency {
        builder = builder.page_concurrency(n);
    }
    if let Some(ref pages) = cli.pages {
        builder = builder.pages(parse_pages(pages)?);
    }
    if let Some(iou) = cli.iou {
        builder = builder.iou_threshold(iou);
    }
    if let Some(policy) = cli.table_policy {
        builder = builder.table_policy(policy.into());
    }
    if let Some(ref list) = cli.precedence {
        builder = builder.extractor_precedence(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
    if let Some(t) = cli.ocr_trigger {
        builder = builder.ocr_trigger_threshold(t);
    }
    if let Some(millis) = cli.timeout_ms {
        builder = builder.timeout(TimeoutPolicy::Fixed { millis });
    }
    if let Some(ref sep) = cli.separator {
        builder = builder.page_separator(parse_separator(sep));
    }
    if cli.metadata {
        builder = builder.include_metadata(true);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn build_pipeline(cli: &Cli, config: PipelineConfig) -> Result<Pipeline> {
    let pipeline = Pipeline::new(config);
    let engine = match (&cli.ocr_provider, cli.ocr) {
        (Some(provider), _) => Some(
            VisionOcrEngine::from_provider_name(
                provider,
                cli.ocr_model.as_deref().unwrap_or(DEFAULT_OCR_MODEL),
            )
            .context("Failed to set up OCR provider")?,
        ),
        (None, true) => Some(
            VisionOcrEngine::from_env(cli.ocr_model.as_deref())
                .context("Failed to auto-detect an OCR provider")?,
        ),
        (None, false) => None,
    };
    let Some(mut engine) = engine else {
        return Ok(pipeline);
    };
    if let Some(t) = cli.ocr_temperature {
        engine = engine.with_temperature(t);
    }
    if let Some(n) = cli.ocr_max_tokens {
        engine = engine.with_max_tokens(n);
    }
    if let Some(n) = cli.ocr_max_retries {
        engine = engine.with_max_retries(n);
    }
    if let Some(ms) = cli.ocr_retry_backoff_ms {
        engine = engine.with_retry_backoff_ms(ms);
    }
    Ok(pipeline.with_ocr_engine(engine))
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }

        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .context(format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(&p) = pages.iter().find(|&&p| p < 1) {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
        }

        return Ok(PageSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(PageSelection::Single(page))
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
