//! Page Splitter: PDF bytes → lazily decoded [`PageHandle`]s.
//!
//! ## Memory model
//!
//! [`PageSplitter::from_bytes`] parses the object graph once (lopdf keeps
//! streams compressed until asked), but no page content is interpreted until
//! [`PageSplitter::page`] is called. Each `PageHandle` owns that page's
//! decoded primitives and nothing else; dropping it releases them. The
//! scheduler asks for a page only when it has a free concurrency slot, so at
//! most `page_concurrency` handles exist at any time.
//!
//! Image XObjects are referenced, not rasterised: the handle shares the
//! encoded stream behind an `Arc` and bitmap decoding is left to the image
//! extractor.

use crate::error::ExtractError;
use crate::geometry::BoundingBox;
use crate::output::DocumentMetadata;
use crate::pipeline::content::{
    self, decode_pdf_string, lookup_dict, resolve, GlyphRun, ImagePlacement, PageFrame,
    PagePrimitives, RulingLine,
};
use crate::extractors::table::ruled_grids;
use crate::pipeline::input::has_pdf_magic;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, info, warn};

/// US Letter, used when a page has no usable MediaBox.
const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

/// Cheap page-level signals about what content the page should yield.
///
/// The quality assessor compares these against the fused items to detect
/// categories that every extractor missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHints {
    /// The page shows at least one non-blank string.
    pub has_text: bool,
    /// The page draws at least one (non-mask) image.
    pub draws_images: bool,
    /// Ruling lines cross to form at least a 2×2 grid of cells.
    pub has_ruled_grid: bool,
}

impl PageHints {
    pub fn from_primitives(p: &PagePrimitives) -> Self {
        Self {
            has_text: !p.glyph_runs.is_empty(),
            draws_images: p.images.iter().any(|i| !i.is_mask),
            has_ruled_grid: has_ruled_grid(&p.rulings),
        }
    }
}

/// Decoded content of exactly one page.
///
/// Owned by whichever stage is processing the page; extractors borrow it.
#[derive(Debug, Clone)]
pub struct PageHandle {
    index: usize,
    width: f32,
    height: f32,
    rotation: i64,
    primitives: PagePrimitives,
    hints: PageHints,
}

impl PageHandle {
    /// Build a handle from already-decoded primitives. Useful for custom
    /// splitters and for testing extractors without a PDF.
    pub fn from_primitives(index: usize, width: f32, height: f32, primitives: PagePrimitives) -> Self {
        let hints = PageHints::from_primitives(&primitives);
        Self {
            index,
            width,
            height,
            rotation: 0,
            primitives,
            hints,
        }
    }

    /// A page with no content.
    pub fn blank(index: usize, width: f32, height: f32) -> Self {
        Self::from_primitives(index, width, height, PagePrimitives::default())
    }

    /// 0-indexed page index in the document.
    pub fn index(&self) -> usize {
        self.index
    }

    /// 1-indexed page number.
    pub fn page_number(&self) -> usize {
        self.index + 1
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// `/Rotate` in degrees. Coordinates are always in the unrotated frame.
    pub fn rotation(&self) -> i64 {
        self.rotation
    }

    /// The whole page as a box.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(0.0, 0.0, self.width, self.height)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn glyph_runs(&self) -> &[GlyphRun] {
        &self.primitives.glyph_runs
    }

    pub fn images(&self) -> &[ImagePlacement] {
        &self.primitives.images
    }

    pub fn rulings(&self) -> &[RulingLine] {
        &self.primitives.rulings
    }

    pub fn hints(&self) -> PageHints {
        self.hints
    }
}

/// A parsed PDF ready to hand out pages.
///
/// `Send + Sync`: the scheduler shares one splitter across page tasks.
pub struct PageSplitter {
    doc: Document,
    page_ids: Vec<ObjectId>,
    source_byte_length: u64,
}

impl std::fmt::Debug for PageSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSplitter")
            .field("pages", &self.page_ids.len())
            .field("source_byte_length", &self.source_byte_length)
            .finish()
    }
}

impl PageSplitter {
    /// Parse `bytes` as a PDF.
    ///
    /// # Errors
    /// [`ExtractError::MalformedDocument`] when the bytes are not a PDF
    /// container, cannot be parsed, or the page tree yields no pages.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExtractError> {
        if !has_pdf_magic(bytes) {
            return Err(ExtractError::MalformedDocument {
                detail: "missing %PDF header".into(),
            });
        }

        let doc = Document::load_mem(bytes).map_err(|e| ExtractError::MalformedDocument {
            detail: e.to_string(),
        })?;

        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if page_ids.is_empty() {
            return Err(ExtractError::MalformedDocument {
                detail: "page tree contains no pages".into(),
            });
        }

        info!(
            "PDF parsed: {} pages, version {}, {} bytes",
            page_ids.len(),
            doc.version,
            bytes.len()
        );

        Ok(Self {
            doc,
            page_ids,
            source_byte_length: bytes.len() as u64,
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Document-level facts. Selection and progress counters are left at 0
    /// for the caller to fill in.
    pub fn metadata(&self) -> DocumentMetadata {
        let info = self
            .doc
            .trailer
            .get(b"Info")
            .ok()
            .and_then(|o| resolve(&self.doc, o))
            .and_then(|o| match o {
                Object::Dictionary(d) => Some(d),
                _ => None,
            });
        let info_string = |key: &[u8]| {
            info.and_then(|d| d.get(key).ok())
                .and_then(|o| resolve(&self.doc, o))
                .and_then(|o| match o {
                    Object::String(bytes, _) => Some(decode_pdf_string(bytes).trim().to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
        };

        DocumentMetadata {
            page_count: self.page_count(),
            pages_selected: 0,
            pages_processed: 0,
            source_byte_length: self.source_byte_length,
            pdf_version: self.doc.version.clone(),
            title: info_string(b"Title"),
            author: info_string(b"Author"),
        }
    }

    /// Decode one page.
    ///
    /// Damaged content streams are not fatal: the page comes back with
    /// whatever could be interpreted, possibly nothing.
    pub fn page(&self, index: usize) -> Result<PageHandle, ExtractError> {
        let &page_id = self
            .page_ids
            .get(index)
            .ok_or(ExtractError::PageOutOfRange {
                page: index + 1,
                total: self.page_count(),
            })?;

        let page_dict = match self.doc.get_dictionary(page_id) {
            Ok(d) => d,
            Err(e) => {
                warn!("Page {}: unreadable page dictionary: {}", index + 1, e);
                let (w, h) = DEFAULT_PAGE_SIZE;
                return Ok(PageHandle::blank(index, w, h));
            }
        };

        let (x0, y0, x1, y1) = self.media_box(page_dict);
        let rotation = self
            .inherited(page_dict, b"Rotate")
            .and_then(content::number)
            .map(|r| r as i64)
            .unwrap_or(0);

        let resources = self.inherited_dict(page_dict, b"Resources");
        let bytes = match self.doc.get_page_content(page_id) {
            Ok(b) => b,
            Err(e) => {
                warn!("Page {}: content stream unreadable: {}", index + 1, e);
                Vec::new()
            }
        };

        let primitives = content::interpret(&self.doc, resources, &bytes, PageFrame { x0, y1 });
        debug!(
            "Page {}: {} glyph runs, {} images, {} rulings",
            index + 1,
            primitives.glyph_runs.len(),
            primitives.images.len(),
            primitives.rulings.len()
        );

        let mut handle = PageHandle::from_primitives(index, x1 - x0, y1 - y0, primitives);
        handle.rotation = rotation;
        Ok(handle)
    }

    /// A fresh lazy iterator over every page, in document order.
    pub fn pages(&self) -> PageIter<'_> {
        self.pages_for((0..self.page_count()).collect())
    }

    /// A lazy iterator over the given 0-indexed pages, in the given order.
    /// Indices past the end are skipped.
    pub fn pages_for(&self, indices: Vec<usize>) -> PageIter<'_> {
        PageIter {
            splitter: self,
            indices: indices.into_iter(),
        }
    }

    fn media_box(&self, page: &Dictionary) -> (f32, f32, f32, f32) {
        let nums: Vec<f32> = match self.inherited(page, b"MediaBox") {
            Some(Object::Array(a)) => a
                .iter()
                .filter_map(|o| resolve(&self.doc, o))
                .filter_map(content::number)
                .collect(),
            _ => Vec::new(),
        };
        if nums.len() == 4 {
            let (x0, x1) = (nums[0].min(nums[2]), nums[0].max(nums[2]));
            let (y0, y1) = (nums[1].min(nums[3]), nums[1].max(nums[3]));
            if x1 > x0 && y1 > y0 {
                return (x0, y0, x1, y1);
            }
        }
        (0.0, 0.0, DEFAULT_PAGE_SIZE.0, DEFAULT_PAGE_SIZE.1)
    }

    /// Look `key` up on the page, then up the `/Parent` chain.
    fn inherited<'d>(&'d self, page: &'d Dictionary, key: &[u8]) -> Option<&'d Object> {
        let mut node = page;
        for _ in 0..32 {
            if let Ok(obj) = node.get(key) {
                return resolve(&self.doc, obj);
            }
            node = lookup_dict(&self.doc, node, b"Parent")?;
        }
        None
    }

    fn inherited_dict<'d>(&'d self, page: &'d Dictionary, key: &[u8]) -> Option<&'d Dictionary> {
        match self.inherited(page, key)? {
            Object::Dictionary(d) => Some(d),
            _ => None,
        }
    }
}

/// Lazy, finite sequence of page handles. Each `next()` decodes one page.
pub struct PageIter<'a> {
    splitter: &'a PageSplitter,
    indices: std::vec::IntoIter<usize>,
}

impl Iterator for PageIter<'_> {
    type Item = PageHandle;

    fn next(&mut self) -> Option<Self::Item> {
        for index in self.indices.by_ref() {
            if let Ok(page) = self.splitter.page(index) {
                return Some(page);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.indices.len()))
    }
}

/// Do the rulings cross to form at least a 2×2 grid of cells?
pub(crate) fn has_ruled_grid(rulings: &[RulingLine]) -> bool {
    !ruled_grids(rulings).is_empty()
}
