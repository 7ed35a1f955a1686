//! Eager (full-document) extraction entry points.
//!
//! [`Pipeline`] holds everything that stays fixed across documents: the
//! registered extractors, the optional OCR engine, and the configuration.
//! The free functions ([`extract`], [`extract_file`], ...) are shorthands for
//! a pipeline with the built-in extractors and no OCR engine.
//!
//! Use [`crate::stream::extract_stream`] instead when pages should be
//! consumed as they complete rather than collected into one result.

use crate::config::PipelineConfig;
use crate::error::ExtractError;
use crate::extractors::{EmbeddedImageExtractor, Extractor, ExtractorSet};
use crate::output::{DocumentMetadata, ExtractionOutput, ExtractionStats, QualityIssue};
use crate::pipeline::aggregate::{ReorderBuffer, ResultAggregator};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::input;
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::page::{PageRun, PageRunner};
use crate::pipeline::split::PageSplitter;
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A configured extraction pipeline. Cheap to clone.
///
/// # Example
///
/// ```rust,no_run
/// use edgequake_pdf_extract::{Pipeline, PipelineConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes = std::fs::read("report.pdf")?;
/// let pipeline = Pipeline::new(PipelineConfig::default());
/// let output = pipeline.extract(&bytes).await?;
/// for table in output.result.tables() {
///     println!("table on page {} ({:.2})", table.page + 1, table.confidence);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    extractors: ExtractorSet,
    ocr: Option<Arc<dyn OcrEngine>>,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("extractors", &self.extractors)
            .field("ocr", &self.ocr.as_ref().map(|e| e.name().to_string()))
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

/// A document split into pages and ready to be driven.
pub(crate) struct Prepared {
    pub splitter: Arc<PageSplitter>,
    pub metadata: DocumentMetadata,
    /// 0-indexed pages to run, ascending.
    pub selected: Vec<usize>,
    pub runner: Arc<PageRunner>,
    pub split_duration_ms: u64,
}

/// How a drive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveEnd {
    Finished,
    Cancelled,
}

impl Pipeline {
    /// Built-in extractors, no OCR engine.
    pub fn new(config: PipelineConfig) -> Self {
        let images = EmbeddedImageExtractor {
            encode_above: config.ocr_trigger_threshold,
            ..Default::default()
        };
        Self {
            extractors: ExtractorSet::builtin().with(images),
            ocr: None,
            config: Arc::new(config),
        }
    }

    /// Replace the whole extractor set.
    pub fn with_extractors(mut self, extractors: ExtractorSet) -> Self {
        self.extractors = extractors;
        self
    }

    /// Register one more extractor (replacing one with the same name).
    pub fn with_extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractors.register(Arc::new(extractor));
        self
    }

    pub fn with_ocr_engine(self, engine: impl OcrEngine + 'static) -> Self {
        self.with_shared_ocr_engine(Arc::new(engine))
    }

    pub fn with_shared_ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(engine);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn extractors(&self) -> &ExtractorSet {
        &self.extractors
    }

    /// Extract every selected page of an in-memory PDF.
    ///
    /// # Errors
    /// Only pipeline-level failures: [`ExtractError::MalformedDocument`],
    /// [`ExtractError::PageOutOfRange`] for an empty selection, and
    /// [`ExtractError::InvalidConfig`]. Page-scoped failures are reported as
    /// quality issues inside the result.
    pub async fn extract(&self, bytes: &[u8]) -> Result<ExtractionOutput, ExtractError> {
        self.extract_with_cancel(bytes, CancellationToken::never()).await
    }

    /// Like [`Pipeline::extract`], stopping early when `token` fires.
    ///
    /// # Errors
    /// On cancellation returns [`ExtractError::Cancelled`] carrying every
    /// page completed before the signal, in page order, with no gaps.
    pub async fn extract_with_cancel(
        &self,
        bytes: &[u8],
        token: CancellationToken,
    ) -> Result<ExtractionOutput, ExtractError> {
        let total_start = Instant::now();
        let prepared = self.prepare(bytes).await?;
        let progress = self.config.progress_callback.clone();
        let total_selected = prepared.selected.len();

        let stats = ExtractionStats {
            total_pages: prepared.metadata.page_count,
            skipped_pages: prepared.metadata.page_count - total_selected,
            split_duration_ms: prepared.split_duration_ms,
            ..Default::default()
        };
        let mut sink = Collect {
            aggregator: ResultAggregator::new(
                &self.config,
                prepared.metadata.clone(),
                prepared.selected.clone(),
            ),
            stats,
        };
        let end = drive(
            &prepared,
            self.config.page_concurrency,
            progress.as_ref(),
            &token,
            &mut sink,
        )
        .await?;
        let Collect {
            aggregator,
            mut stats,
        } = sink;

        let completed = aggregator.completed();
        if let Some(ref cb) = progress {
            cb.on_extraction_complete(total_selected, completed);
        }
        stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

        match end {
            DriveEnd::Cancelled => {
                info!("Extraction cancelled after {}/{} pages", completed, total_selected);
                Err(ExtractError::Cancelled {
                    partial: Box::new(aggregator.cancelled()),
                })
            }
            DriveEnd::Finished => {
                let result = aggregator.finish();
                info!(
                    "Extraction complete: {} pages, {} items, fidelity {:.2}, {}ms total",
                    completed,
                    result.items.len(),
                    result.quality.overall_fidelity,
                    stats.total_duration_ms
                );
                Ok(ExtractionOutput { result, stats })
            }
        }
    }

    /// Read `path` and extract it.
    pub async fn extract_file(&self, path: impl AsRef<Path>) -> Result<ExtractionOutput, ExtractError> {
        let resolved = input::resolve_input(path).await?;
        self.extract(&resolved.bytes).await
    }

    /// Extract `input` and write the result to `output`.
    ///
    /// A `.md` output path gets Markdown (page separator and front matter
    /// from the config); anything else gets pretty JSON. The write is atomic:
    /// a temp file in the target directory is persisted over `output`.
    pub async fn extract_to_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<ExtractionStats, ExtractError> {
        let extracted = self.extract_file(input).await?;
        let path = output.as_ref().to_path_buf();

        let markdown = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("md"));
        let body = if markdown {
            extracted
                .result
                .to_markdown(&self.config.page_separator, self.config.include_metadata)
        } else {
            extracted
                .result
                .to_json()
                .map_err(|e| ExtractError::Internal(format!("result serialisation: {e}")))?
        };

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, body.as_bytes()))
            .await
            .map_err(|e| ExtractError::Internal(format!("write task failed: {e}")))?
            .map_err(|source| ExtractError::OutputWriteFailed { path, source })?;

        Ok(extracted.stats)
    }

    /// Synchronous wrapper around [`Pipeline::extract`].
    ///
    /// Creates a temporary tokio runtime internally; do not call from inside
    /// an async context.
    pub fn extract_sync(&self, bytes: &[u8]) -> Result<ExtractionOutput, ExtractError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
            .block_on(self.extract(bytes))
    }

    /// Validate the setup, split the document, and resolve the page
    /// selection and timeout.
    pub(crate) async fn prepare(&self, bytes: &[u8]) -> Result<Prepared, ExtractError> {
        self.config.validate()?;
        if self.extractors.is_empty() {
            return Err(ExtractError::InvalidConfig("no extractors registered".into()));
        }

        let split_start = Instant::now();
        let owned = bytes.to_vec();
        let splitter = tokio::task::spawn_blocking(move || PageSplitter::from_bytes(&owned))
            .await
            .map_err(|e| ExtractError::Internal(format!("split task failed: {e}")))??;
        let split_duration_ms = split_start.elapsed().as_millis() as u64;

        let total_pages = splitter.page_count();
        let selected = self.config.pages.to_indices(total_pages);
        if selected.is_empty() {
            return Err(ExtractError::PageOutOfRange {
                page: 0,
                total: total_pages,
            });
        }

        let timeout = self
            .config
            .timeout
            .resolve(selected.len(), self.config.page_concurrency);
        debug!(
            "Selected {} of {} pages; per-call timeout {:?}; extractors {:?}",
            selected.len(),
            total_pages,
            timeout,
            self.extractors.names()
        );

        let mut metadata = splitter.metadata();
        metadata.pages_selected = selected.len();

        let runner = PageRunner::new(
            self.extractors.clone(),
            self.ocr.clone(),
            Arc::clone(&self.config),
            timeout,
        );

        Ok(Prepared {
            splitter: Arc::new(splitter),
            metadata,
            selected,
            runner: Arc::new(runner),
            split_duration_ms,
        })
    }
}

/// Receives finished pages, in page order, from [`drive`].
#[async_trait]
pub(crate) trait PageSink: Send {
    async fn deliver(&mut self, run: PageRun) -> Result<(), ExtractError>;
}

/// Collects pages into a document result for the eager entry points.
struct Collect<'a> {
    aggregator: ResultAggregator<'a>,
    stats: ExtractionStats,
}

#[async_trait]
impl PageSink for Collect<'_> {
    async fn deliver(&mut self, run: PageRun) -> Result<(), ExtractError> {
        self.stats.processed_pages += 1;
        self.stats.extractor_calls += run.extractor_calls;
        self.stats.extractor_failures += run.extractor_failures;
        self.stats.ocr_calls += run.ocr_calls;
        self.stats.ocr_failures += run.ocr_failures;
        self.stats.fused_items += run.outcome.items.len();
        self.aggregator.push(run.outcome, run.all_extractors_failed)
    }
}

/// Run every selected page, at most `concurrency` at a time, and hand each
/// finished page to `deliver` in page order.
///
/// Page `i` of the selection is only started once it fits the reorder
/// window, so at most `concurrency` page results exist at any moment
/// whether running or waiting for an earlier page. On cancellation the
/// in-flight tasks are aborted and whatever was not yet delivered is
/// dropped.
pub(crate) async fn drive<S: PageSink>(
    prepared: &Prepared,
    concurrency: usize,
    progress: Option<&ProgressCallback>,
    token: &CancellationToken,
    sink: &mut S,
) -> Result<DriveEnd, ExtractError> {
    let total = prepared.selected.len();
    if let Some(cb) = progress {
        cb.on_extraction_start(total);
    }

    let mut buffer: ReorderBuffer<PageRun> = ReorderBuffer::new(concurrency);
    let mut tasks: JoinSet<(usize, PageRun)> = JoinSet::new();
    let mut next_to_start = 0;

    loop {
        while next_to_start < total && buffer.accepts(next_to_start) && !token.is_cancelled() {
            spawn_page(&mut tasks, prepared, next_to_start, progress.cloned());
            next_to_start += 1;
        }
        if tasks.is_empty() {
            break;
        }

        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tasks.abort_all();
                return Ok(DriveEnd::Cancelled);
            }
            joined = tasks.join_next() => joined,
        };

        match joined {
            Some(Ok((position, run))) => {
                buffer.insert(position, run)?;
                for (_, run) in buffer.pop_ready() {
                    if let Some(cb) = progress {
                        report(cb, &run, total);
                    }
                    sink.deliver(run).await?;
                }
            }
            Some(Err(e)) if e.is_cancelled() => continue,
            Some(Err(e)) => {
                tasks.abort_all();
                return Err(ExtractError::Internal(format!("page task failed: {e}")));
            }
            None => break,
        }
    }

    if token.is_cancelled() && buffer.next_index() < total {
        return Ok(DriveEnd::Cancelled);
    }
    Ok(DriveEnd::Finished)
}

fn spawn_page(
    tasks: &mut JoinSet<(usize, PageRun)>,
    prepared: &Prepared,
    position: usize,
    progress: Option<ProgressCallback>,
) {
    let index = prepared.selected[position];
    let total = prepared.selected.len();
    let splitter = Arc::clone(&prepared.splitter);
    let runner = Arc::clone(&prepared.runner);

    tasks.spawn(async move {
        if let Some(ref cb) = progress {
            cb.on_page_start(index + 1, total);
        }
        // Content-stream decoding is CPU-bound.
        let decoded = tokio::task::spawn_blocking(move || splitter.page(index)).await;
        let run = match decoded {
            Ok(Ok(page)) => runner.run(page).await,
            Ok(Err(e)) => {
                warn!("Page {}: could not be decoded: {}", index + 1, e);
                runner.undecodable(index, &e.to_string())
            }
            Err(e) => {
                warn!("Page {}: decoder panicked: {}", index + 1, e);
                runner.undecodable(index, "page decoder panicked")
            }
        };
        (position, run)
    });
}

fn report(cb: &ProgressCallback, run: &PageRun, total: usize) {
    let page_num = run.outcome.page + 1;
    for issue in &run.outcome.issues {
        match issue {
            QualityIssue::ExtractorFailed { failure, .. } => {
                cb.on_page_issue(page_num, total, &failure.to_string())
            }
            QualityIssue::OcrFailed { region, failure, .. } => {
                cb.on_page_issue(page_num, total, &format!("{region}: {failure}"))
            }
            _ => {}
        }
    }
    cb.on_page_complete(page_num, total, run.outcome.items.len());
}

fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(body)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ── Free-function shorthands ─────────────────────────────────────────────

/// Extract an in-memory PDF with the built-in extractors.
pub async fn extract(bytes: &[u8], config: &PipelineConfig) -> Result<ExtractionOutput, ExtractError> {
    Pipeline::new(config.clone()).extract(bytes).await
}

/// Read and extract a PDF file with the built-in extractors.
pub async fn extract_file(
    path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<ExtractionOutput, ExtractError> {
    Pipeline::new(config.clone()).extract_file(path).await
}

/// Extract a PDF file and write the result (JSON, or Markdown for `.md`).
pub async fn extract_to_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<ExtractionStats, ExtractError> {
    Pipeline::new(config.clone()).extract_to_file(input, output).await
}

/// Synchronous wrapper around [`extract`].
pub fn extract_sync(bytes: &[u8], config: &PipelineConfig) -> Result<ExtractionOutput, ExtractError> {
    Pipeline::new(config.clone()).extract_sync(bytes)
}

/// Document metadata without running any extractor.
pub async fn inspect(path: impl AsRef<Path>) -> Result<DocumentMetadata, ExtractError> {
    let resolved = input::resolve_input(path).await?;
    inspect_bytes(resolved.bytes).await
}

/// [`inspect`] for an in-memory PDF.
pub async fn inspect_bytes(bytes: Vec<u8>) -> Result<DocumentMetadata, ExtractError> {
    tokio::task::spawn_blocking(move || PageSplitter::from_bytes(&bytes).map(|s| s.metadata()))
        .await
        .map_err(|e| ExtractError::Internal(format!("split task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let err = Pipeline::default().extract(b"hello").await.unwrap_err();
        assert!(matches!(err, ExtractError::MalformedDocument { .. }));
    }

    #[tokio::test]
    async fn empty_extractor_set_is_rejected() {
        let err = Pipeline::default()
            .with_extractors(ExtractorSet::new())
            .extract(b"%PDF-1.4")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidConfig(_)));
    }
}
