//! Output types: what the pipeline hands to prompt assembly.
//!
//! [`ExtractionResult`] is deterministic: the same bytes and the same
//! configuration always serialise to the same JSON. Anything that varies
//! between runs (timings, retry counts) lives in [`ExtractionStats`] and is
//! returned next to the result inside [`ExtractionOutput`], never inside it.

use crate::error::{ExtractorFailure, OcrFailure};
use crate::fragment::{Capability, MarginBand, SemanticRole};
use crate::geometry::BoundingBox;
use serde::{Deserialize, Serialize};

/// Text recognised inside an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrText {
    /// Empty when the engine's confidence fell below the OCR floor.
    pub text: String,
    /// Character-level confidence reported by the engine.
    pub confidence: f32,
    pub low_confidence: bool,
}

/// The merged payload of a fused item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FusedContent {
    Text {
        text: String,
    },
    Table {
        rows: Vec<Vec<String>>,
        row_count: usize,
        column_count: usize,
    },
    Image {
        name: String,
        pixel_width: u32,
        pixel_height: u32,
        ocr: Option<OcrText>,
    },
}

/// One extractor's part in a fused item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub extractor: String,
    pub confidence: f32,
    /// This source supplied the payload.
    pub canonical: bool,
    /// This source agreed with the canonical payload (text similarity at or
    /// above the agreement threshold). Always `true` for the canonical source.
    pub agrees: bool,
}

/// The unit of final output: one text block, table, or image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedItem {
    /// 0-indexed page.
    pub page: usize,
    /// Position in the page's reading order. Dense and unique per page.
    pub reading_order: usize,
    pub role: SemanticRole,
    pub bbox: BoundingBox,
    /// Combined confidence in `[0, 1]`.
    pub confidence: f32,
    pub sources: Vec<SourceContribution>,
    pub content: FusedContent,
}

impl FusedItem {
    pub fn category(&self) -> Capability {
        match self.content {
            FusedContent::Text { .. } => Capability::Text,
            FusedContent::Table { .. } => Capability::Table,
            FusedContent::Image { .. } => Capability::Image,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            FusedContent::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn canonical_source(&self) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.canonical)
            .map(|s| s.extractor.as_str())
    }
}

/// Document-level facts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Pages in the document.
    pub page_count: usize,
    /// Pages chosen by the page selection.
    pub pages_selected: usize,
    /// Pages whose results are included in this result.
    pub pages_processed: usize,
    pub source_byte_length: u64,
    pub pdf_version: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Per-category fidelity scores. `None` means no items of that category.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryScores {
    pub text_confidence: Option<f32>,
    pub table_accuracy: Option<f32>,
    pub image_relevance: Option<f32>,
}

impl CategoryScores {
    pub fn get(&self, category: Capability) -> Option<f32> {
        match category {
            Capability::Text => self.text_confidence,
            Capability::Table => self.table_accuracy,
            Capability::Image => self.image_relevance,
        }
    }
}

/// Something the caller should know about the quality of the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QualityIssue {
    /// An item's confidence is below its category floor.
    BelowFloor {
        page: usize,
        reading_order: usize,
        category: Capability,
        confidence: f32,
        floor: f32,
    },
    /// The page shows signs of a category but produced no item of it.
    MissingCategory { page: usize, category: Capability },
    /// An extractor failed on a page; its output is missing.
    ExtractorFailed {
        page: usize,
        failure: ExtractorFailure,
    },
    /// A data-bearing image was OCR'd below the OCR confidence floor.
    LowConfidenceOcr {
        page: usize,
        reading_order: usize,
        confidence: f32,
    },
    /// OCR could not run for a data-bearing image.
    OcrFailed {
        page: usize,
        region: String,
        failure: OcrFailure,
    },
    /// No table candidate in a group had a rectangular grid.
    InvalidTableGrid { page: usize, reading_order: usize },
    /// The run was cancelled after this many pages.
    Cancelled { pages_completed: usize },
}

impl QualityIssue {
    pub fn page(&self) -> Option<usize> {
        match self {
            QualityIssue::BelowFloor { page, .. }
            | QualityIssue::MissingCategory { page, .. }
            | QualityIssue::ExtractorFailed { page, .. }
            | QualityIssue::LowConfidenceOcr { page, .. }
            | QualityIssue::OcrFailed { page, .. }
            | QualityIssue::InvalidTableGrid { page, .. } => Some(*page),
            QualityIssue::Cancelled { .. } => None,
        }
    }
}

/// Aggregated quality report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractionQuality {
    pub scores: CategoryScores,
    pub overall_fidelity: f32,
    pub issues: Vec<QualityIssue>,
    /// The caller should consider a fallback path (e.g. page-image prompting).
    pub needs_fallback: bool,
    /// Pages whose content is known to be incomplete.
    pub fallback_pages: Vec<usize>,
}

impl ExtractionQuality {
    pub fn has_issue(&self, pred: impl Fn(&QualityIssue) -> bool) -> bool {
        self.issues.iter().any(pred)
    }

    pub fn issues_for_page(&self, page: usize) -> impl Iterator<Item = &QualityIssue> {
        self.issues.iter().filter(move |i| i.page() == Some(page))
    }
}

/// The document-level output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub metadata: DocumentMetadata,
    /// Ordered by page, then reading order.
    pub items: Vec<FusedItem>,
    pub quality: ExtractionQuality,
    /// `true` when the run stopped early on request; `items` then holds only
    /// the pages that completed before the signal.
    pub cancelled: bool,
}

impl ExtractionResult {
    pub fn items_of(&self, category: Capability) -> impl Iterator<Item = &FusedItem> {
        self.items.iter().filter(move |i| i.category() == category)
    }

    pub fn text_blocks(&self) -> impl Iterator<Item = &FusedItem> {
        self.items_of(Capability::Text)
    }

    pub fn tables(&self) -> impl Iterator<Item = &FusedItem> {
        self.items_of(Capability::Table)
    }

    pub fn images(&self) -> impl Iterator<Item = &FusedItem> {
        self.items_of(Capability::Image)
    }

    pub fn items_on_page(&self, page: usize) -> impl Iterator<Item = &FusedItem> {
        self.items.iter().filter(move |i| i.page == page)
    }

    /// Distinct pages that contributed at least one item, ascending.
    pub fn pages_with_items(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.items.iter().map(|i| i.page).collect();
        pages.dedup();
        pages
    }

    /// Stable pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// A text item in a page's top or bottom margin that may turn out to be a
/// running header or footer once other pages are seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FurnitureCandidate {
    pub reading_order: usize,
    pub band: MarginBand,
    /// Normalised text with digits masked.
    pub key: String,
}

/// Everything one page contributed, as yielded by the page stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 0-indexed page.
    pub page: usize,
    /// Ordered by reading order.
    pub items: Vec<FusedItem>,
    pub issues: Vec<QualityIssue>,
    /// The page's content is known to be incomplete.
    pub needs_fallback: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub furniture_candidates: Vec<FurnitureCandidate>,
}

/// Non-deterministic run statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total_pages: usize,
    pub processed_pages: usize,
    pub skipped_pages: usize,
    pub extractor_calls: usize,
    pub extractor_failures: usize,
    pub ocr_calls: usize,
    pub ocr_failures: usize,
    pub fused_items: usize,
    pub split_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// What the eager entry points return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub result: ExtractionResult,
    pub stats: ExtractionStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(page: usize, order: usize, content: FusedContent) -> FusedItem {
        FusedItem {
            page,
            reading_order: order,
            role: SemanticRole::Paragraph,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            confidence: 0.9,
            sources: vec![SourceContribution {
                extractor: "text-layer".into(),
                confidence: 0.9,
                canonical: true,
                agrees: true,
            }],
            content,
        }
    }

    #[test]
    fn partitions_by_category() {
        let result = ExtractionResult {
            items: vec![
                item(0, 0, FusedContent::Text { text: "a".into() }),
                item(
                    0,
                    1,
                    FusedContent::Table {
                        rows: vec![vec!["x".into()]],
                        row_count: 1,
                        column_count: 1,
                    },
                ),
                item(1, 0, FusedContent::Text { text: "b".into() }),
            ],
            ..Default::default()
        };
        assert_eq!(result.text_blocks().count(), 2);
        assert_eq!(result.tables().count(), 1);
        assert_eq!(result.images().count(), 0);
        assert_eq!(result.items_on_page(1).count(), 1);
        assert_eq!(result.pages_with_items(), vec![0, 1]);
    }

    #[test]
    fn canonical_source_lookup() {
        let i = item(0, 0, FusedContent::Text { text: "a".into() });
        assert_eq!(i.canonical_source(), Some("text-layer"));
        assert_eq!(i.text(), Some("a"));
    }

    #[test]
    fn issues_carry_pages() {
        let q = ExtractionQuality {
            issues: vec![
                QualityIssue::MissingCategory {
                    page: 3,
                    category: Capability::Text,
                },
                QualityIssue::Cancelled { pages_completed: 4 },
            ],
            ..Default::default()
        };
        assert_eq!(q.issues_for_page(3).count(), 1);
        assert!(q.has_issue(|i| matches!(i, QualityIssue::Cancelled { .. })));
    }

    #[test]
    fn json_is_tagged() {
        let i = item(0, 0, FusedContent::Text { text: "hi".into() });
        let json = serde_json::to_string(&i).unwrap();
        assert!(json.contains("\"type\":\"text\""), "got: {json}");
        assert!(json.contains("\"role\":\"paragraph\""), "got: {json}");
    }
}
