//! # edgequake-pdf-extract
//!
//! Extract text, tables and images from large PDFs into one confidence-scored
//! structure ready for LLM prompting.
//!
//! ## Why this crate?
//!
//! No single PDF extractor is right about everything. A text-layer decoder
//! reads prose well and tables badly; a ruling-line table detector finds
//! grids but not the paragraph next to them; an OCR engine reads a chart's
//! labels but not the page's fonts. This crate runs several independent,
//! imperfect extractors over every page, reconciles what they report into
//! one deduplicated set of items, and tells you how far to trust each one.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 1. Split      lazy page handles over lopdf (bounded memory)
//!  ├─ 2. Extract    every registered extractor, concurrently, under timeouts
//!  ├─ 3. Classify   heading / paragraph / caption / chart / ... + reading order
//!  ├─ 4. OCR        data-bearing images only
//!  ├─ 5. Fuse       IoU grouping, precedence + agreement rules
//!  ├─ 6. Assess     per-category scores, floors, fallback flags
//!  └─ 7. Aggregate  strict page order via a bounded reorder buffer
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf_extract::{extract_file, PageSeparator, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let output = extract_file("report.pdf", &config).await?;
//!     eprintln!(
//!         "fidelity {:.2}, {} issues",
//!         output.result.quality.overall_fidelity,
//!         output.result.quality.issues.len()
//!     );
//!     println!("{}", output.result.to_markdown(&PageSeparator::HorizontalRule, false));
//!     Ok(())
//! }
//! ```
//!
//! ## Plugging in extractors and OCR
//!
//! Anything that can look at a page implements [`Extractor`]; anything that
//! can read an image implements [`OcrEngine`]. Register them on a
//! [`Pipeline`]. [`VisionOcrEngine`] is a ready-made OCR engine backed by a
//! vision LLM through `edgequake-llm`.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfx` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf-extract = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod extractors;
pub mod fragment;
pub mod geometry;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    AgreementBonus, CategoryWeights, ConfidenceFloors, PageSelection, PageSeparator,
    PipelineConfig, PipelineConfigBuilder, TablePolicy, TimeoutPolicy,
};
pub use error::{ExtractError, ExtractorFailure, OcrFailure, ReorderError};
pub use extract::{extract, extract_file, extract_sync, extract_to_file, inspect, inspect_bytes, Pipeline};
pub use extractors::{Extractor, ExtractorSet};
pub use fragment::{
    Capability, ClassifiedFragment, FragmentPayload, ImageRegion, ImageStructure, RawFragment,
    SemanticRole, TableGrid,
};
pub use geometry::BoundingBox;
pub use output::{
    CategoryScores, DocumentMetadata, ExtractionOutput, ExtractionQuality, ExtractionResult,
    ExtractionStats, FusedContent, FusedItem, OcrText, PageOutcome, QualityIssue,
    SourceContribution,
};
pub use pipeline::aggregate::ReorderBuffer;
pub use pipeline::cancel::{cancellation, CancellationHandle, CancellationToken};
pub use pipeline::ocr::{OcrEngine, OcrOutput};
pub use pipeline::split::{PageHandle, PageSplitter};
pub use pipeline::vision::VisionOcrEngine;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback};
pub use stream::{extract_stream, PageStream};
