//! Classifier: semantic roles and reading order for one page's fragments.
//!
//! Roles come from page-local statistics, never from absolute font sizes:
//! a 14pt line is a heading on a page of 10pt body text and a paragraph on
//! a page set in 14pt. Running headers and footers cannot be recognised
//! from one page, so the classifier only marks margin candidates here and
//! [`FurnitureIndex`] confirms them once the same text shows up on another
//! page.
//!
//! ## Reading order
//!
//! Fragments are bucketed into horizontal bands one text line high, then
//! ordered by band, left edge, and finally extraction sequence. Two
//! fragments on the same visual line therefore read left to right even if
//! their tops differ by a point or two.

use crate::config::PipelineConfig;
use crate::fragment::{ClassifiedFragment, FragmentPayload, MarginBand, RawFragment, SemanticRole};
use crate::geometry::BoundingBox;
use crate::output::{FurnitureCandidate, PageOutcome};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Text at least this many times the median size is a heading.
const HEADING_RATIO: f32 = 1.25;
/// The page's largest text needs to beat the median by this much to count
/// as a heading when it sits in the top third.
const TOP_HEADING_RATIO: f32 = 1.1;
/// Footnotes are at most this many times the median size.
const FOOTNOTE_RATIO: f32 = 0.85;
/// Footnotes start in the bottom share of the page.
const FOOTNOTE_ZONE: f32 = 0.85;
/// Share of the page height treated as the top/bottom margin band.
const MARGIN_BAND: f32 = 0.08;
/// A caption starts at most this many of its own line heights below the
/// table or image it describes.
const CAPTION_GAP_LINES: f32 = 2.0;
/// Images covering at least this share of the page are photos rather than
/// decoration.
const PHOTO_PAGE_SHARE: f32 = 0.05;
/// Reading band height when the page has no text to measure.
const FALLBACK_BAND: f32 = 12.0;

static RE_CAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(figure|fig\.|table|chart)\s*\d").unwrap());

/// Text-size statistics for one page.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageStats {
    /// Character-weighted median text size.
    pub median_size: Option<f32>,
    pub largest_size: Option<f32>,
}

impl PageStats {
    pub fn from_fragments(fragments: &[RawFragment]) -> Self {
        let mut sizes: Vec<(f32, usize)> = fragments
            .iter()
            .filter_map(|f| match &f.payload {
                FragmentPayload::Text(t) => {
                    let chars = t.text.chars().filter(|c| !c.is_whitespace()).count();
                    Some((text_size(f), chars.max(1)))
                }
                _ => None,
            })
            .filter(|(s, _)| s.is_finite() && *s > 0.0)
            .collect();
        if sizes.is_empty() {
            return Self::default();
        }
        sizes.sort_by(|a, b| a.0.total_cmp(&b.0));

        let total: usize = sizes.iter().map(|(_, w)| w).sum();
        let mut seen = 0;
        let mut median = sizes[0].0;
        for (size, weight) in &sizes {
            seen += weight;
            if seen * 2 >= total {
                median = *size;
                break;
            }
        }
        Self {
            median_size: Some(median),
            largest_size: sizes.last().map(|(s, _)| *s),
        }
    }
}

/// Font size when the extractor reported one, else the box height.
fn text_size(fragment: &RawFragment) -> f32 {
    match &fragment.payload {
        FragmentPayload::Text(t) => t.font_size.unwrap_or_else(|| fragment.bbox.height()),
        _ => fragment.bbox.height(),
    }
}

/// Assigns roles and reading order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classifier {
    /// Images above this confidence are data-bearing and flagged for OCR.
    pub ocr_trigger_threshold: f32,
    /// Fixed reading band height; `None` uses the page's median text size.
    pub reading_band_height: Option<f32>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            ocr_trigger_threshold: 0.5,
            reading_band_height: None,
        }
    }
}

impl Classifier {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ocr_trigger_threshold: config.ocr_trigger_threshold,
            reading_band_height: config.reading_band_height,
        }
    }

    /// Classify one page's fragments. The result is sorted by reading order,
    /// which runs densely from 0.
    pub fn classify(
        &self,
        page_width: f32,
        page_height: f32,
        fragments: Vec<RawFragment>,
    ) -> Vec<ClassifiedFragment> {
        let stats = PageStats::from_fragments(&fragments);
        let page_area = (page_width * page_height).max(1.0);
        let anchors: Vec<BoundingBox> = fragments
            .iter()
            .filter(|f| matches!(f.payload, FragmentPayload::Table(_) | FragmentPayload::Image(_)))
            .map(|f| f.bbox)
            .collect();

        let band = self
            .reading_band_height
            .or(stats.median_size)
            .filter(|b| *b > 0.0)
            .unwrap_or(FALLBACK_BAND);

        let mut classified: Vec<ClassifiedFragment> = fragments
            .into_iter()
            .map(|fragment| {
                let (role, ocr_requested, margin) = match &fragment.payload {
                    FragmentPayload::Table(_) => (SemanticRole::Table, false, None),
                    FragmentPayload::Image(_) => {
                        let (role, ocr) = self.image_role(&fragment, page_area);
                        (role, ocr, None)
                    }
                    FragmentPayload::Text(t) => (
                        text_role(&fragment, &t.text, &stats, &anchors, page_height),
                        false,
                        margin_band(&fragment.bbox, page_height),
                    ),
                };
                ClassifiedFragment {
                    fragment,
                    role,
                    reading_order: 0,
                    ocr_requested,
                    margin,
                }
            })
            .collect();

        classified.sort_by(|a, b| {
            let band_a = (a.fragment.bbox.top / band).floor() as i64;
            let band_b = (b.fragment.bbox.top / band).floor() as i64;
            band_a
                .cmp(&band_b)
                .then(a.fragment.bbox.left.total_cmp(&b.fragment.bbox.left))
                .then(a.fragment.id.seq.cmp(&b.fragment.id.seq))
        });
        for (i, c) in classified.iter_mut().enumerate() {
            c.reading_order = i;
        }

        debug!(
            "Classified {} fragments (median size {:?}, band {:.1}pt, {} flagged for OCR)",
            classified.len(),
            stats.median_size,
            band,
            classified.iter().filter(|c| c.ocr_requested).count()
        );
        classified
    }

    fn image_role(&self, fragment: &RawFragment, page_area: f32) -> (SemanticRole, bool) {
        if fragment.confidence > self.ocr_trigger_threshold {
            (SemanticRole::Chart, true)
        } else if fragment.bbox.area() / page_area >= PHOTO_PAGE_SHARE {
            (SemanticRole::Photo, false)
        } else {
            (SemanticRole::Decorative, false)
        }
    }
}

fn text_role(
    fragment: &RawFragment,
    text: &str,
    stats: &PageStats,
    anchors: &[BoundingBox],
    page_height: f32,
) -> SemanticRole {
    let Some(median) = stats.median_size else {
        return SemanticRole::Paragraph;
    };
    let size = text_size(fragment);
    let bbox = &fragment.bbox;

    let largest_at_top = stats
        .largest_size
        .is_some_and(|largest| size >= largest && size >= TOP_HEADING_RATIO * median)
        && bbox.top < page_height / 3.0;
    if size >= HEADING_RATIO * median || largest_at_top {
        return SemanticRole::Heading;
    }

    if RE_CAPTION.is_match(text.trim_start()) {
        return SemanticRole::Caption;
    }
    if size <= median && anchors.iter().any(|a| sits_below(bbox, a, size)) {
        return SemanticRole::Caption;
    }

    if size <= FOOTNOTE_RATIO * median && bbox.top >= FOOTNOTE_ZONE * page_height {
        return SemanticRole::Footnote;
    }
    SemanticRole::Paragraph
}

/// `text` starts just below `anchor` and shares some horizontal span.
fn sits_below(text: &BoundingBox, anchor: &BoundingBox, line_height: f32) -> bool {
    let gap = text.top - anchor.bottom;
    gap >= -0.25 * line_height
        && gap <= CAPTION_GAP_LINES * line_height
        && text.horizontal_overlap(anchor) > 0.0
}

fn margin_band(bbox: &BoundingBox, page_height: f32) -> Option<MarginBand> {
    if bbox.bottom <= MARGIN_BAND * page_height {
        Some(MarginBand::Top)
    } else if bbox.top >= (1.0 - MARGIN_BAND) * page_height {
        Some(MarginBand::Bottom)
    } else {
        None
    }
}

/// Margin text seen so far, keyed by band and digit-masked text.
///
/// A candidate becomes a running header or footer once its key has been
/// seen on at least two distinct pages.
#[derive(Debug, Clone, Default)]
pub struct FurnitureIndex {
    pages: HashMap<(MarginBand, String), BTreeSet<usize>>,
}

impl FurnitureIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page's candidates.
    pub fn observe(&mut self, page: usize, candidates: &[FurnitureCandidate]) {
        for c in candidates {
            self.pages
                .entry((c.band, c.key.clone()))
                .or_default()
                .insert(page);
        }
    }

    pub fn is_repeated(&self, band: MarginBand, key: &str) -> bool {
        self.pages
            .get(&(band, key.to_string()))
            .is_some_and(|pages| pages.len() >= 2)
    }

    /// Promote the outcome's repeated candidates to `PageHeader` /
    /// `PageFooter`. Returns how many items changed role.
    pub fn apply(&self, outcome: &mut PageOutcome) -> usize {
        let mut promoted = 0;
        for c in &outcome.furniture_candidates {
            if !self.is_repeated(c.band, &c.key) {
                continue;
            }
            if let Some(item) = outcome
                .items
                .iter_mut()
                .find(|i| i.reading_order == c.reading_order)
            {
                item.role = match c.band {
                    MarginBand::Top => SemanticRole::PageHeader,
                    MarginBand::Bottom => SemanticRole::PageFooter,
                };
                promoted += 1;
            }
        }
        promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FragmentId, ImageRegion};

    fn text(seq: usize, bbox: BoundingBox, s: &str, size: f32) -> RawFragment {
        let mut f = RawFragment::text(bbox, s, Some(size), 0.9);
        f.id = FragmentId { page: 0, seq };
        f
    }

    fn image(seq: usize, bbox: BoundingBox, confidence: f32) -> RawFragment {
        let mut f = RawFragment::image(
            bbox,
            ImageRegion {
                name: format!("Im{seq}"),
                pixel_width: 200,
                pixel_height: 200,
                structure: None,
                png: None,
            },
            confidence,
        );
        f.id = FragmentId { page: 0, seq };
        f
    }

    fn role_of(out: &[ClassifiedFragment], seq: usize) -> SemanticRole {
        out.iter().find(|c| c.fragment.id.seq == seq).unwrap().role
    }

    fn body(seq: usize, top: f32) -> RawFragment {
        text(
            seq,
            BoundingBox::new(72.0, top, 500.0, top + 10.0),
            "Body text that fills most of the line width.",
            10.0,
        )
    }

    #[test]
    fn weighted_median_follows_the_bulk_of_characters() {
        let frags = vec![
            text(0, BoundingBox::new(0.0, 0.0, 10.0, 24.0), "Title", 24.0),
            body(1, 100.0),
            body(2, 120.0),
        ];
        let stats = PageStats::from_fragments(&frags);
        assert_eq!(stats.median_size, Some(10.0));
        assert_eq!(stats.largest_size, Some(24.0));
    }

    #[test]
    fn large_text_is_a_heading() {
        let frags = vec![
            text(0, BoundingBox::new(72.0, 400.0, 300.0, 418.0), "Results", 18.0),
            body(1, 100.0),
            body(2, 120.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        assert_eq!(role_of(&out, 0), SemanticRole::Heading);
        assert_eq!(role_of(&out, 1), SemanticRole::Paragraph);
    }

    #[test]
    fn modestly_larger_text_is_a_heading_only_near_the_top() {
        let top = vec![
            text(0, BoundingBox::new(72.0, 80.0, 300.0, 91.5), "Overview", 11.5),
            body(1, 300.0),
            body(2, 320.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, top);
        assert_eq!(role_of(&out, 0), SemanticRole::Heading);

        let low = vec![
            text(0, BoundingBox::new(72.0, 600.0, 300.0, 611.5), "Overview", 11.5),
            body(1, 300.0),
            body(2, 320.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, low);
        assert_eq!(role_of(&out, 0), SemanticRole::Paragraph);
    }

    #[test]
    fn captions_by_prefix_and_by_position() {
        let frags = vec![
            image(0, BoundingBox::new(100.0, 200.0, 400.0, 400.0), 0.2),
            text(1, BoundingBox::new(100.0, 405.0, 380.0, 414.0), "Quarterly revenue by region", 9.0),
            text(2, BoundingBox::new(72.0, 600.0, 300.0, 610.0), "Table 3: Totals", 10.0),
            body(3, 450.0),
            body(4, 470.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        assert_eq!(role_of(&out, 1), SemanticRole::Caption);
        assert_eq!(role_of(&out, 2), SemanticRole::Caption);
        assert_eq!(role_of(&out, 3), SemanticRole::Paragraph);
    }

    #[test]
    fn small_text_at_the_bottom_is_a_footnote() {
        let frags = vec![
            body(0, 100.0),
            body(1, 120.0),
            text(2, BoundingBox::new(72.0, 700.0, 400.0, 708.0), "1 Source: annual filings.", 8.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        assert_eq!(role_of(&out, 2), SemanticRole::Footnote);
        assert_eq!(out.iter().find(|c| c.fragment.id.seq == 2).unwrap().margin, None);
    }

    #[test]
    fn image_roles_follow_trigger_and_size() {
        let frags = vec![
            image(0, BoundingBox::new(0.0, 0.0, 300.0, 300.0), 0.8),
            image(1, BoundingBox::new(0.0, 400.0, 300.0, 700.0), 0.2),
            image(2, BoundingBox::new(500.0, 10.0, 520.0, 30.0), 0.2),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        let chart = out.iter().find(|c| c.fragment.id.seq == 0).unwrap();
        assert_eq!(chart.role, SemanticRole::Chart);
        assert!(chart.ocr_requested);
        assert_eq!(role_of(&out, 1), SemanticRole::Photo);
        assert_eq!(role_of(&out, 2), SemanticRole::Decorative);
        assert!(out.iter().filter(|c| c.ocr_requested).count() == 1);
    }

    #[test]
    fn trigger_is_strictly_greater() {
        let frags = vec![image(0, BoundingBox::new(0.0, 0.0, 300.0, 300.0), 0.5)];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        assert!(!out[0].ocr_requested);
    }

    #[test]
    fn reading_order_is_band_then_left_then_sequence() {
        // Right column line slightly higher than the left one: same band.
        let frags = vec![
            text(0, BoundingBox::new(320.0, 100.0, 540.0, 110.0), "right", 10.0),
            text(1, BoundingBox::new(72.0, 102.0, 290.0, 112.0), "left", 10.0),
            text(2, BoundingBox::new(72.0, 130.0, 290.0, 140.0), "next", 10.0),
            text(3, BoundingBox::new(72.0, 132.0, 290.0, 142.0), "twin", 10.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        let order: Vec<usize> = out.iter().map(|c| c.fragment.id.seq).collect();
        assert_eq!(order, vec![1, 0, 2, 3]);
        let ro: Vec<usize> = out.iter().map(|c| c.reading_order).collect();
        assert_eq!(ro, vec![0, 1, 2, 3]);
    }

    #[test]
    fn margin_bands_are_marked() {
        let frags = vec![
            text(0, BoundingBox::new(72.0, 20.0, 300.0, 30.0), "ACME Corp Annual Report", 10.0),
            body(1, 300.0),
            text(2, BoundingBox::new(280.0, 760.0, 330.0, 770.0), "Page 3", 10.0),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        assert_eq!(out.iter().find(|c| c.fragment.id.seq == 0).unwrap().margin, Some(MarginBand::Top));
        assert_eq!(out.iter().find(|c| c.fragment.id.seq == 2).unwrap().margin, Some(MarginBand::Bottom));
        assert_eq!(out.iter().find(|c| c.fragment.id.seq == 1).unwrap().margin, None);
    }

    #[test]
    fn page_without_text_uses_fallback_band() {
        let frags = vec![
            image(1, BoundingBox::new(300.0, 100.0, 400.0, 150.0), 0.9),
            image(0, BoundingBox::new(50.0, 105.0, 150.0, 150.0), 0.9),
        ];
        let out = Classifier::default().classify(612.0, 792.0, frags);
        assert_eq!(out[0].fragment.id.seq, 0);
    }

    fn outcome(page: usize, footer: &str) -> PageOutcome {
        use crate::output::{FusedContent, FusedItem};
        PageOutcome {
            page,
            items: vec![FusedItem {
                page,
                reading_order: 0,
                role: SemanticRole::Paragraph,
                bbox: BoundingBox::new(280.0, 760.0, 330.0, 770.0),
                confidence: 0.9,
                sources: vec![],
                content: FusedContent::Text {
                    text: footer.to_string(),
                },
            }],
            furniture_candidates: vec![FurnitureCandidate {
                reading_order: 0,
                band: MarginBand::Bottom,
                key: crate::pipeline::normalize::furniture_key(footer),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn furniture_needs_two_pages() {
        let mut index = FurnitureIndex::new();
        let mut first = outcome(0, "Page 1 of 9");
        index.observe(0, &first.furniture_candidates);
        assert_eq!(index.apply(&mut first), 0);
        assert_eq!(first.items[0].role, SemanticRole::Paragraph);

        let mut second = outcome(1, "Page 2 of 9");
        index.observe(1, &second.furniture_candidates);
        assert_eq!(index.apply(&mut second), 1);
        assert_eq!(second.items[0].role, SemanticRole::PageFooter);
        assert_eq!(index.apply(&mut first), 1);
        assert_eq!(first.items[0].role, SemanticRole::PageFooter);
    }

    #[test]
    fn same_page_repeats_do_not_count() {
        let mut index = FurnitureIndex::new();
        let c = outcome(0, "Draft").furniture_candidates;
        index.observe(0, &c);
        index.observe(0, &c);
        assert!(!index.is_repeated(MarginBand::Bottom, "draft"));
    }
}
