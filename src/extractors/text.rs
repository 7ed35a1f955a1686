//! `text-layer`: the page's own text, one fragment per visual line.

use crate::error::ExtractorFailure;
use crate::extractors::{Extractor, TEXT_LAYER};
use crate::fragment::{Capability, RawFragment};
use crate::geometry::BoundingBox;
use crate::pipeline::content::GlyphRun;
use crate::pipeline::split::PageHandle;
use async_trait::async_trait;

/// Confidence of a fully decodable line.
const BASE_CONFIDENCE: f32 = 0.95;
/// Runs whose baselines differ by less than this many ems share a line.
const BASELINE_TOLERANCE_EM: f32 = 0.3;
/// A horizontal gap of at least this many ems starts a new line segment.
const LINE_GAP_EM: f32 = 1.5;
/// Gaps wider than this many ems get a joining space.
const SPACE_GAP_EM: f32 = 0.15;

/// A visual line: glyph runs sharing a baseline with small gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub text: String,
    pub bbox: BoundingBox,
    pub baseline: f32,
    /// Largest run size on the line.
    pub font_size: f32,
    /// Left edge of each run, paired with the byte offset where its text
    /// starts in `text`.
    pub run_starts: Vec<(f32, usize)>,
}

/// Group glyph runs into lines.
///
/// Runs are bucketed by baseline, ordered left to right within a bucket,
/// then split wherever the gap between neighbours reaches `split_gap_em`.
/// The output is ordered top to bottom, then left to right.
pub fn group_lines(runs: &[GlyphRun], split_gap_em: f32) -> Vec<TextLine> {
    let mut sorted: Vec<&GlyphRun> = runs.iter().collect();
    sorted.sort_by(|a, b| {
        a.baseline
            .total_cmp(&b.baseline)
            .then(a.bbox.left.total_cmp(&b.bbox.left))
    });

    let mut buckets: Vec<Vec<&GlyphRun>> = Vec::new();
    for run in sorted {
        match buckets.last_mut() {
            Some(bucket)
                if (run.baseline - bucket[0].baseline).abs()
                    <= BASELINE_TOLERANCE_EM * bucket[0].font_size.max(1.0) =>
            {
                bucket.push(run)
            }
            _ => buckets.push(vec![run]),
        }
    }

    let mut lines = Vec::new();
    for mut bucket in buckets {
        bucket.sort_by(|a, b| a.bbox.left.total_cmp(&b.bbox.left));
        let mut current: Option<TextLine> = None;
        for run in bucket {
            let em = run.font_size.max(1.0);
            if let Some(line) = current.as_mut() {
                let gap = run.bbox.left - line.bbox.right;
                if gap < split_gap_em * em {
                    if gap > SPACE_GAP_EM * em && !line.text.ends_with(' ') && !run.text.starts_with(' ') {
                        line.text.push(' ');
                    }
                    line.run_starts.push((run.bbox.left, line.text.len()));
                    line.text.push_str(&run.text);
                    line.bbox = line.bbox.union(&run.bbox);
                    line.font_size = line.font_size.max(run.font_size);
                    continue;
                }
                lines.extend(current.take());
            }
            current = Some(TextLine {
                text: run.text.clone(),
                bbox: run.bbox,
                baseline: run.baseline,
                font_size: run.font_size,
                run_starts: vec![(run.bbox.left, 0)],
            });
        }
        lines.extend(current);
    }
    lines
}

/// Share of characters that decoded to something printable.
pub(crate) fn printable_ratio(text: &str) -> f32 {
    let mut total = 0usize;
    let mut printable = 0usize;
    for ch in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if ch != '\u{FFFD}' && !ch.is_control() {
            printable += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        printable as f32 / total as f32
    }
}

/// Reads the page's text operators.
///
/// Confidence reflects how much of each line decoded to printable
/// characters: pages using CID fonts without a usable encoding score low
/// and leave room for an OCR-backed text extractor to win.
#[derive(Debug, Clone, Default)]
pub struct TextLayerExtractor;

#[async_trait]
impl Extractor for TextLayerExtractor {
    fn name(&self) -> &str {
        TEXT_LAYER
    }

    fn capability(&self) -> Capability {
        Capability::Text
    }

    async fn extract(&self, page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
        Ok(group_lines(page.glyph_runs(), LINE_GAP_EM)
            .into_iter()
            .filter_map(|line| {
                let text = line.text.trim().replace('\u{FFFD}', "");
                if text.is_empty() {
                    return None;
                }
                let confidence = BASE_CONFIDENCE * printable_ratio(&line.text);
                Some(RawFragment::text(line.bbox, text, Some(line.font_size), confidence))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentPayload;
    use crate::pipeline::content::PagePrimitives;

    fn run(text: &str, left: f32, baseline: f32, size: f32) -> GlyphRun {
        let width = text.chars().count() as f32 * size * 0.5;
        GlyphRun {
            text: text.into(),
            bbox: BoundingBox::new(left, baseline - 0.8 * size, left + width, baseline + 0.2 * size),
            font_size: size,
            baseline,
        }
    }

    #[test]
    fn runs_on_one_baseline_join_with_space() {
        let lines = group_lines(&[run("World", 140.0, 100.0, 12.0), run("Hello", 100.0, 100.2, 12.0)], 1.5);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "Hello World");
        assert_eq!(lines[0].run_starts, vec![(100.0, 0), (140.0, 6)]);
    }

    #[test]
    fn wide_gap_splits_line() {
        let lines = group_lines(&[run("Left", 72.0, 100.0, 10.0), run("Right", 300.0, 100.0, 10.0)], 1.5);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Left");
        assert_eq!(lines[1].text, "Right");
    }

    #[test]
    fn lines_ordered_top_to_bottom() {
        let lines = group_lines(&[run("second", 72.0, 130.0, 12.0), run("first", 72.0, 100.0, 12.0)], 1.5);
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["first", "second"]);
    }

    #[test]
    fn printable_ratio_counts_replacement_chars() {
        assert_eq!(printable_ratio("abcd"), 1.0);
        assert_eq!(printable_ratio("ab\u{FFFD}\u{FFFD}"), 0.5);
        assert_eq!(printable_ratio("   "), 0.0);
    }

    #[tokio::test]
    async fn extracts_one_fragment_per_line() {
        let primitives = PagePrimitives {
            glyph_runs: vec![run("Hello World", 72.0, 100.0, 12.0), run("Next", 72.0, 120.0, 12.0)],
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = TextLayerExtractor.extract(&page).await.unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].text_content(), Some("Hello World"));
        assert!((frags[0].confidence - 0.95).abs() < 1e-6);
        match &frags[0].payload {
            FragmentPayload::Text(t) => assert_eq!(t.font_size, Some(12.0)),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_glyphs_lower_confidence() {
        let primitives = PagePrimitives {
            glyph_runs: vec![run("ab\u{FFFD}\u{FFFD}", 72.0, 100.0, 12.0)],
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = TextLayerExtractor.extract(&page).await.unwrap();
        assert_eq!(frags[0].text_content(), Some("ab"));
        assert!((frags[0].confidence - 0.475).abs() < 1e-6);
    }
}
