//! Error types for the edgequake-pdf-extract library.
//!
//! Two tiers mirror the two ways an extraction can go wrong:
//!
//! * [`ExtractError`]: **pipeline-level**: the document cannot be split into
//!   pages at all, the caller cancelled, or the configuration is unusable.
//!   Returned as `Err(ExtractError)` from the top-level `extract*` functions.
//!
//! * [`ExtractorFailure`] / [`OcrFailure`]: **page-scoped**: one extractor or
//!   the OCR engine failed on one page. These never abort the document; they
//!   are recorded as [`crate::output::QualityIssue`]s and the page continues
//!   with whatever the remaining extractors produced.

use crate::output::ExtractionResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All pipeline-level errors returned by the library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// The byte stream is not a PDF container or its page tree is unreadable.
    #[error("Malformed PDF document: {detail}")]
    MalformedDocument { detail: String },

    /// Selected page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Run control ───────────────────────────────────────────────────────
    /// The caller cancelled the run. `partial` holds every page completed
    /// before the signal, in order, with `cancelled = true`.
    #[error("Extraction cancelled after {} completed pages", partial.metadata.pages_processed)]
    Cancelled { partial: Box<ExtractionResult> },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── OCR provider errors ───────────────────────────────────────────────
    /// The vision provider for OCR could not be created (missing API key etc.).
    #[error("OCR provider '{provider}' is not configured.\n{hint}")]
    OcrProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    /// The partial result carried by a cancellation, if any.
    pub fn partial_result(&self) -> Option<&ExtractionResult> {
        match self {
            ExtractError::Cancelled { partial } => Some(partial),
            _ => None,
        }
    }
}

/// A page-scoped extractor failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorFailure {
    /// The extractor's backing service or model is not reachable.
    #[error("Page {page}: extractor '{extractor}' unavailable: {detail}")]
    Unavailable {
        extractor: String,
        page: usize,
        detail: String,
    },

    /// The call exceeded its per-extractor timeout.
    #[error("Page {page}: extractor '{extractor}' timed out after {elapsed_ms}ms")]
    Timeout {
        extractor: String,
        page: usize,
        elapsed_ms: u64,
    },

    /// The extractor returned output the pipeline could not use.
    #[error("Page {page}: extractor '{extractor}' produced unusable output: {detail}")]
    ParseError {
        extractor: String,
        page: usize,
        detail: String,
    },
}

impl ExtractorFailure {
    pub fn extractor(&self) -> &str {
        match self {
            ExtractorFailure::Unavailable { extractor, .. }
            | ExtractorFailure::Timeout { extractor, .. }
            | ExtractorFailure::ParseError { extractor, .. } => extractor,
        }
    }

    pub fn page(&self) -> usize {
        match self {
            ExtractorFailure::Unavailable { page, .. }
            | ExtractorFailure::Timeout { page, .. }
            | ExtractorFailure::ParseError { page, .. } => *page,
        }
    }

    /// Re-home a failure reported by an extractor onto the registered name
    /// and page the pipeline actually ran it for.
    pub(crate) fn stamped(self, name: &str, page_index: usize) -> Self {
        match self {
            ExtractorFailure::Unavailable { detail, .. } => ExtractorFailure::Unavailable {
                extractor: name.to_string(),
                page: page_index,
                detail,
            },
            ExtractorFailure::Timeout { elapsed_ms, .. } => ExtractorFailure::Timeout {
                extractor: name.to_string(),
                page: page_index,
                elapsed_ms,
            },
            ExtractorFailure::ParseError { detail, .. } => ExtractorFailure::ParseError {
                extractor: name.to_string(),
                page: page_index,
                detail,
            },
        }
    }
}

/// A page-scoped OCR failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OcrFailure {
    /// No OCR engine is configured, or it cannot be reached.
    #[error("OCR unavailable: {detail}")]
    Unavailable { detail: String },

    /// The OCR call exceeded its timeout.
    #[error("OCR timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The engine ran but returned an error.
    #[error("OCR engine error: {detail}")]
    Engine { detail: String },
}

/// Misuse of the ordered reorder buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReorderError {
    /// The index is not inside the buffer's current window.
    #[error("page {index} is outside the reorder window [{next}, {end})")]
    OutOfWindow { index: usize, next: usize, end: usize },

    /// A result for this index was already inserted.
    #[error("page {index} was already delivered")]
    Duplicate { index: usize },
}

impl From<ReorderError> for ExtractError {
    fn from(e: ReorderError) -> Self {
        ExtractError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_display() {
        let e = ExtractError::MalformedDocument {
            detail: "no xref".into(),
        };
        assert!(e.to_string().contains("no xref"));
    }

    #[test]
    fn timeout_display_mentions_page_and_extractor() {
        let e = ExtractorFailure::Timeout {
            extractor: "ruled-tables".into(),
            page: 4,
            elapsed_ms: 1500,
        };
        let msg = e.to_string();
        assert!(msg.contains("Page 4"), "got: {msg}");
        assert!(msg.contains("ruled-tables"), "got: {msg}");
        assert!(msg.contains("1500ms"), "got: {msg}");
    }

    #[test]
    fn stamping_overrides_name_and_page() {
        let e = ExtractorFailure::Unavailable {
            extractor: "whatever".into(),
            page: 0,
            detail: "down".into(),
        }
        .stamped("cloud", 7);
        assert_eq!(e.extractor(), "cloud");
        assert_eq!(e.page(), 7);
    }

    #[test]
    fn failure_serialises_with_kind_tag() {
        let e = ExtractorFailure::ParseError {
            extractor: "x".into(),
            page: 1,
            detail: "bad".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"parse_error\""), "got: {json}");
    }

    #[test]
    fn reorder_error_converts_to_internal() {
        let e: ExtractError = ReorderError::Duplicate { index: 2 }.into();
        assert!(matches!(e, ExtractError::Internal(_)));
    }
}
