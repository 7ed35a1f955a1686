//! Transient per-page observations produced by extractors and the classifier.
//!
//! A [`RawFragment`] is one extractor's guess about one region of one page.
//! Fragments never outlive their page: the fusion engine consumes them and
//! only [`crate::output::FusedItem`]s survive into the final result.

use crate::geometry::BoundingBox;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What kind of content an extractor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Table,
    Image,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Text, Capability::Table, Capability::Image];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Text => "text",
            Capability::Table => "table",
            Capability::Image => "image",
        })
    }
}

/// Identity of a fragment within its page.
///
/// `seq` is assigned by the pipeline in extractor registration order, then in
/// the order each extractor returned its fragments, so it doubles as the
/// stable "original extraction sequence" tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentId {
    pub page: usize,
    pub seq: usize,
}

/// A run of text as seen by a text extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
    /// Effective font size in points, when the extractor knows it.
    pub font_size: Option<f32>,
}

/// A table guess: row-major cell text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableGrid {
    pub rows: Vec<Vec<String>>,
}

impl TableGrid {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// A grid is valid when it has at least one cell and every row has the
    /// same number of columns.
    pub fn is_valid(&self) -> bool {
        let cols = self.column_count();
        cols > 0 && self.rows.iter().all(|r| r.len() == cols)
    }

    pub fn cell_count(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    pub fn filled_cell_count(&self) -> usize {
        self.rows
            .iter()
            .flatten()
            .filter(|c| !c.trim().is_empty())
            .count()
    }
}

/// Internal-structure hints an image extractor may report.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageStructure {
    /// Likelihood that the image contains text-like regions.
    pub text_like: f32,
    /// Likelihood that the image contains lines/axes/bars.
    pub chart_like: f32,
}

/// An image region detected on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegion {
    /// Resource name of the image (e.g. `Im0`) or an extractor-chosen label.
    pub name: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub structure: Option<ImageStructure>,
    /// PNG bytes for OCR. Released with the page, never serialised.
    #[serde(skip)]
    pub png: Option<Arc<[u8]>>,
}

/// The payload of a fragment; its variant determines the capability.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentPayload {
    Text(TextPayload),
    Table(TableGrid),
    Image(ImageRegion),
}

impl FragmentPayload {
    pub fn capability(&self) -> Capability {
        match self {
            FragmentPayload::Text(_) => Capability::Text,
            FragmentPayload::Table(_) => Capability::Table,
            FragmentPayload::Image(_) => Capability::Image,
        }
    }
}

/// One extractor's candidate observation of content in a page region.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFragment {
    pub id: FragmentId,
    /// Registered name of the producing extractor.
    pub source: String,
    pub bbox: BoundingBox,
    pub payload: FragmentPayload,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f32,
}

impl RawFragment {
    /// Build an unstamped fragment. The pipeline fills in `id` and `source`
    /// once the extractor returns.
    pub fn new(bbox: BoundingBox, payload: FragmentPayload, confidence: f32) -> Self {
        Self {
            id: FragmentId { page: 0, seq: 0 },
            source: String::new(),
            bbox,
            payload,
            confidence,
        }
    }

    pub fn text(bbox: BoundingBox, text: impl Into<String>, font_size: Option<f32>, confidence: f32) -> Self {
        Self::new(
            bbox,
            FragmentPayload::Text(TextPayload {
                text: text.into(),
                font_size,
            }),
            confidence,
        )
    }

    pub fn table(bbox: BoundingBox, rows: Vec<Vec<String>>, confidence: f32) -> Self {
        Self::new(bbox, FragmentPayload::Table(TableGrid::new(rows)), confidence)
    }

    pub fn image(bbox: BoundingBox, region: ImageRegion, confidence: f32) -> Self {
        Self::new(bbox, FragmentPayload::Image(region), confidence)
    }

    pub fn capability(&self) -> Capability {
        self.payload.capability()
    }

    pub fn page_index(&self) -> usize {
        self.id.page
    }

    /// Text content for text fragments, `None` otherwise.
    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            FragmentPayload::Text(t) => Some(&t.text),
            _ => None,
        }
    }
}

/// Semantic role assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticRole {
    Heading,
    Paragraph,
    Caption,
    Footnote,
    PageHeader,
    PageFooter,
    Table,
    Chart,
    Photo,
    Decorative,
}

impl SemanticRole {
    /// Running headers/footers repeated on every page.
    pub fn is_furniture(self) -> bool {
        matches!(self, SemanticRole::PageHeader | SemanticRole::PageFooter)
    }

    /// Whether two fragments carrying these roles may describe the same
    /// logical content. Capability equality is checked separately.
    pub fn is_compatible_with(self, other: SemanticRole) -> bool {
        if self.is_furniture() || other.is_furniture() {
            return self == other;
        }
        match (self, other) {
            (SemanticRole::Table, r) | (r, SemanticRole::Table) => r == SemanticRole::Table,
            _ => true,
        }
    }
}

/// Which margin band a text fragment sits in, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginBand {
    Top,
    Bottom,
}

/// A [`RawFragment`] with a role and a position in the page's reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFragment {
    pub fragment: RawFragment,
    pub role: SemanticRole,
    /// Unique and monotonic within a page.
    pub reading_order: usize,
    /// Data-bearing image that should go through OCR.
    pub ocr_requested: bool,
    pub margin: Option<MarginBand>,
}
