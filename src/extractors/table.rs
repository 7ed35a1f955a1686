//! Table extractors.
//!
//! Two independent detectors with different failure modes:
//!
//! * [`RuledTableExtractor`] trusts drawn lines. It is precise on bordered
//!   tables and blind to borderless ones.
//! * [`AlignedTableExtractor`] trusts text alignment. It finds borderless
//!   tables but may split or merge columns when alignment is loose.
//!
//! Both may fire on the same table; the fusion engine decides which grid
//! wins.

use crate::error::ExtractorFailure;
use crate::extractors::text::{group_lines, TextLine};
use crate::extractors::{Extractor, ALIGNED_TABLES, RULED_TABLES};
use crate::fragment::{Capability, RawFragment};
use crate::geometry::BoundingBox;
use crate::pipeline::content::{GlyphRun, Orientation, RulingLine};
use crate::pipeline::split::PageHandle;
use async_trait::async_trait;
use tracing::debug;

/// Lines closer than this (points) are the same grid line.
const SNAP: f32 = 2.0;

// ── Ruled tables ─────────────────────────────────────────────────────────

/// Builds grids from crossing horizontal and vertical rulings.
#[derive(Debug, Clone)]
pub struct RuledTableExtractor {
    /// Confidence of a grid whose every cell has text.
    pub base_confidence: f32,
    /// Lowest confidence a detected grid is reported at.
    pub min_confidence: f32,
}

impl Default for RuledTableExtractor {
    fn default() -> Self {
        Self {
            base_confidence: 0.9,
            min_confidence: 0.5,
        }
    }
}

#[async_trait]
impl Extractor for RuledTableExtractor {
    fn name(&self) -> &str {
        RULED_TABLES
    }

    fn capability(&self) -> Capability {
        Capability::Table
    }

    async fn extract(&self, page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
        let mut out = Vec::new();
        for grid in ruled_grids(page.rulings()) {
            let rows = fill_cells(&grid, page.glyph_runs());
            let cells = (grid.rows() * grid.cols()) as f32;
            let filled = rows.iter().flatten().filter(|c| !c.is_empty()).count() as f32;
            let confidence = (self.base_confidence * filled / cells).max(self.min_confidence);
            debug!(
                "Page {}: ruled grid {}x{} ({} of {} cells filled)",
                page.page_number(),
                grid.rows(),
                grid.cols(),
                filled,
                cells
            );
            out.push(RawFragment::table(grid.bbox(), rows, confidence));
        }
        Ok(out)
    }
}

/// Row and column boundaries of one ruled grid, ascending.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RuledGrid {
    pub ys: Vec<f32>,
    pub xs: Vec<f32>,
}

impl RuledGrid {
    fn rows(&self) -> usize {
        self.ys.len().saturating_sub(1)
    }

    fn cols(&self) -> usize {
        self.xs.len().saturating_sub(1)
    }

    fn bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.xs[0],
            self.ys[0],
            self.xs[self.xs.len() - 1],
            self.ys[self.ys.len() - 1],
        )
    }

    /// (row, col) of the cell containing the point.
    fn cell_at(&self, x: f32, y: f32) -> Option<(usize, usize)> {
        let row = self.ys.windows(2).position(|w| y >= w[0] && y < w[1])?;
        let col = self.xs.windows(2).position(|w| x >= w[0] && x < w[1])?;
        Some((row, col))
    }
}

fn crosses(h: &RulingLine, v: &RulingLine) -> bool {
    v.position >= h.start - SNAP
        && v.position <= h.end + SNAP
        && h.position >= v.start - SNAP
        && h.position <= v.end + SNAP
}

fn snapped(mut values: Vec<f32>) -> Vec<f32> {
    values.sort_by(f32::total_cmp);
    values.dedup_by(|a, b| (*a - *b).abs() <= SNAP);
    values
}

/// Connected components of crossing rulings with at least two rows and two
/// columns of cells.
pub(crate) fn ruled_grids(rulings: &[RulingLine]) -> Vec<RuledGrid> {
    let n = rulings.len();
    let mut parent: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (&rulings[i], &rulings[j]);
            let linked = match (a.orientation, b.orientation) {
                (Orientation::Horizontal, Orientation::Vertical) => crosses(a, b),
                (Orientation::Vertical, Orientation::Horizontal) => crosses(b, a),
                _ => false,
            };
            if linked {
                let (ra, rb) = (find(&mut parent, i), find(&mut parent, j));
                if ra != rb {
                    parent[ra.max(rb)] = ra.min(rb);
                }
            }
        }
    }

    let roots: Vec<usize> = (0..n).map(|i| find(&mut parent, i)).collect();
    let mut order: Vec<usize> = roots.clone();
    order.sort_unstable();
    order.dedup();

    let mut grids = Vec::new();
    for root in order {
        let members: Vec<&RulingLine> = (0..n)
            .filter(|&i| roots[i] == root)
            .map(|i| &rulings[i])
            .collect();
        let ys = snapped(
            members
                .iter()
                .filter(|r| r.orientation == Orientation::Horizontal)
                .map(|r| r.position)
                .collect(),
        );
        let xs = snapped(
            members
                .iter()
                .filter(|r| r.orientation == Orientation::Vertical)
                .map(|r| r.position)
                .collect(),
        );
        if ys.len() >= 3 && xs.len() >= 3 {
            grids.push(RuledGrid { ys, xs });
        }
    }
    grids.sort_by(|a, b| a.ys[0].total_cmp(&b.ys[0]).then(a.xs[0].total_cmp(&b.xs[0])));
    grids
}

/// Assign each glyph run to the cell containing its centre.
fn fill_cells(grid: &RuledGrid, runs: &[GlyphRun]) -> Vec<Vec<String>> {
    let mut cells: Vec<Vec<Vec<&GlyphRun>>> = vec![vec![Vec::new(); grid.cols()]; grid.rows()];
    for run in runs {
        let (cx, cy) = run.bbox.centre();
        if let Some((r, c)) = grid.cell_at(cx, cy) {
            cells[r][c].push(run);
        }
    }
    cells
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|mut cell| {
                    cell.sort_by(|a, b| {
                        a.baseline
                            .total_cmp(&b.baseline)
                            .then(a.bbox.left.total_cmp(&b.bbox.left))
                    });
                    cell.iter()
                        .map(|r| r.text.trim())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect()
        })
        .collect()
}

// ── Aligned tables ───────────────────────────────────────────────────────

/// Finds borderless tables: runs of lines whose gaps line up in columns.
#[derive(Debug, Clone)]
pub struct AlignedTableExtractor {
    /// Confidence of a block whose every line matches every column.
    pub base_confidence: f32,
    /// Minimum number of aligned lines.
    pub min_rows: usize,
    /// Gaps of at least this many ems separate columns.
    pub column_gap_em: f32,
}

impl Default for AlignedTableExtractor {
    fn default() -> Self {
        Self {
            base_confidence: 0.6,
            min_rows: 3,
            column_gap_em: 2.0,
        }
    }
}

/// A line cut into column segments: (left edge, text).
#[derive(Debug, Clone)]
struct SegmentedLine {
    bbox: BoundingBox,
    height: f32,
    segments: Vec<(f32, String)>,
}

impl AlignedTableExtractor {
    fn segment(&self, line: &TextLine) -> SegmentedLine {
        let em = line.font_size.max(1.0);
        let mut segments: Vec<(f32, String)> = Vec::new();

        // Runs were already split at wide gaps by `group_lines`; split
        // further inside runs at multi-space gaps, estimating positions at
        // half an em per character.
        let mut bounds: Vec<(f32, usize)> = line.run_starts.clone();
        bounds.push((line.bbox.right, line.text.len()));
        for w in bounds.windows(2) {
            let ((left, from), (_, to)) = (w[0], w[1]);
            let run_text = &line.text[from..to];
            let mut offset_chars = 0usize;
            for piece in split_on_wide_spaces(run_text) {
                let (lead, text) = piece;
                offset_chars += lead;
                let x = left + offset_chars as f32 * 0.5 * em;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    match segments.last_mut() {
                        Some((prev_left, prev)) if x - (*prev_left + prev.chars().count() as f32 * 0.5 * em) < self.column_gap_em * em => {
                            prev.push(' ');
                            prev.push_str(trimmed);
                        }
                        _ => segments.push((x, trimmed.to_string())),
                    }
                }
                offset_chars += text.chars().count();
            }
        }

        SegmentedLine {
            bbox: line.bbox,
            height: line.bbox.height().max(1.0),
            segments,
        }
    }

    fn emit(&self, block: &[SegmentedLine], columns: &[f32], tol: f32, out: &mut Vec<RawFragment>) {
        if block.len() < self.min_rows || columns.len() < 2 {
            return;
        }
        let mut matched = 0usize;
        let rows: Vec<Vec<String>> = block
            .iter()
            .map(|line| {
                let mut row = vec![String::new(); columns.len()];
                for (x, text) in &line.segments {
                    let col = columns
                        .iter()
                        .rposition(|&c| c <= x + tol)
                        .unwrap_or(0);
                    if columns.iter().any(|&c| (c - x).abs() <= tol) {
                        matched += 1;
                    }
                    if !row[col].is_empty() {
                        row[col].push(' ');
                    }
                    row[col].push_str(text);
                }
                row
            })
            .collect();
        let consistency = (matched as f32 / (block.len() * columns.len()) as f32).min(1.0);
        let bbox = BoundingBox::enclosing(block.iter().map(|l| &l.bbox))
            .unwrap_or_else(|| BoundingBox::new(0.0, 0.0, 0.0, 0.0));
        out.push(RawFragment::table(bbox, rows, self.base_confidence * consistency));
    }
}

/// Split at runs of two or more spaces. Yields (skipped chars, piece).
fn split_on_wide_spaces(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut skipped = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b' ' && i + 1 < bytes.len() && bytes[i + 1] == b' ' {
            let mut j = i;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            out.push((skipped, &text[start..i]));
            skipped = j - i;
            start = j;
            i = j;
        } else {
            i += 1;
        }
    }
    out.push((skipped, &text[start..]));
    out
}

#[async_trait]
impl Extractor for AlignedTableExtractor {
    fn name(&self) -> &str {
        ALIGNED_TABLES
    }

    fn capability(&self) -> Capability {
        Capability::Table
    }

    async fn extract(&self, page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
        // Keep whole visual lines together; columns are found by `segment`.
        let lines: Vec<SegmentedLine> = group_lines(page.glyph_runs(), f32::INFINITY)
            .iter()
            .map(|l| self.segment(l))
            .collect();

        let mut out = Vec::new();
        let mut block: Vec<SegmentedLine> = Vec::new();
        let mut columns: Vec<f32> = Vec::new();
        let mut tol = 0.0f32;

        for line in lines {
            if line.segments.len() < 2 {
                self.emit(&block, &columns, tol, &mut out);
                block.clear();
                continue;
            }
            let contiguous = block
                .last()
                .map(|prev| line.bbox.top - prev.bbox.bottom < 2.5 * prev.height)
                .unwrap_or(false);
            let matches = line
                .segments
                .iter()
                .filter(|(x, _)| columns.iter().any(|&c| (c - x).abs() <= tol))
                .count();
            if contiguous && matches >= 2 {
                block.push(line);
            } else {
                self.emit(&block, &columns, tol, &mut out);
                tol = line.height * 0.75;
                columns = line.segments.iter().map(|(x, _)| *x).collect();
                block.clear();
                block.push(line);
            }
        }
        self.emit(&block, &columns, tol, &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentPayload;
    use crate::pipeline::content::PagePrimitives;

    fn h(y: f32, x0: f32, x1: f32) -> RulingLine {
        RulingLine {
            orientation: Orientation::Horizontal,
            position: y,
            start: x0,
            end: x1,
        }
    }

    fn v(x: f32, y0: f32, y1: f32) -> RulingLine {
        RulingLine {
            orientation: Orientation::Vertical,
            position: x,
            start: y0,
            end: y1,
        }
    }

    fn run(text: &str, left: f32, baseline: f32) -> GlyphRun {
        let width = text.chars().count() as f32 * 5.0;
        GlyphRun {
            text: text.into(),
            bbox: BoundingBox::new(left, baseline - 8.0, left + width, baseline + 2.0),
            font_size: 10.0,
            baseline,
        }
    }

    fn grid_3x3_lines() -> Vec<RulingLine> {
        vec![
            h(100.0, 50.0, 250.0),
            h(130.0, 50.0, 250.0),
            h(160.0, 50.0, 250.0),
            v(50.0, 100.0, 160.0),
            v(150.0, 100.0, 160.0),
            v(250.0, 100.0, 160.0),
        ]
    }

    #[test]
    fn crossing_rulings_form_grid() {
        let grids = ruled_grids(&grid_3x3_lines());
        assert_eq!(grids.len(), 1);
        assert_eq!(grids[0].ys, vec![100.0, 130.0, 160.0]);
        assert_eq!(grids[0].xs, vec![50.0, 150.0, 250.0]);
    }

    #[test]
    fn single_box_is_not_a_table() {
        let lines = vec![
            h(100.0, 50.0, 250.0),
            h(160.0, 50.0, 250.0),
            v(50.0, 100.0, 160.0),
            v(250.0, 100.0, 160.0),
        ];
        assert!(ruled_grids(&lines).is_empty());
    }

    #[test]
    fn separate_grids_stay_separate() {
        let mut lines = grid_3x3_lines();
        lines.extend(grid_3x3_lines().into_iter().map(|mut l| {
            l.position += if l.orientation == Orientation::Horizontal { 400.0 } else { 0.0 };
            if l.orientation == Orientation::Vertical {
                l.start += 400.0;
                l.end += 400.0;
            }
            l
        }));
        assert_eq!(ruled_grids(&lines).len(), 2);
    }

    #[tokio::test]
    async fn ruled_extractor_fills_cells() {
        let primitives = PagePrimitives {
            rulings: grid_3x3_lines(),
            glyph_runs: vec![
                run("Name", 60.0, 120.0),
                run("Age", 160.0, 120.0),
                run("Ada", 60.0, 150.0),
                run("36", 160.0, 150.0),
            ],
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = RuledTableExtractor::default().extract(&page).await.unwrap();
        assert_eq!(frags.len(), 1);
        match &frags[0].payload {
            FragmentPayload::Table(g) => {
                assert_eq!(g.rows, vec![vec!["Name", "Age"], vec!["Ada", "36"]]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!((frags[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(frags[0].bbox, BoundingBox::new(50.0, 100.0, 250.0, 160.0));
    }

    #[tokio::test]
    async fn ruled_extractor_confidence_floor() {
        let primitives = PagePrimitives {
            rulings: grid_3x3_lines(),
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = RuledTableExtractor::default().extract(&page).await.unwrap();
        assert!((frags[0].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn wide_space_split() {
        assert_eq!(split_on_wide_spaces("a  b"), vec![(0, "a"), (2, "b")]);
        assert_eq!(split_on_wide_spaces("a b"), vec![(0, "a b")]);
    }

    #[tokio::test]
    async fn aligned_extractor_finds_borderless_table() {
        let primitives = PagePrimitives {
            glyph_runs: vec![
                run("Item", 72.0, 100.0),
                run("Qty", 200.0, 100.0),
                run("Apple", 72.0, 114.0),
                run("3", 200.0, 114.0),
                run("Pear", 72.0, 128.0),
                run("12", 201.0, 128.0),
                run("A closing paragraph line.", 72.0, 160.0),
            ],
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = AlignedTableExtractor::default().extract(&page).await.unwrap();
        assert_eq!(frags.len(), 1);
        match &frags[0].payload {
            FragmentPayload::Table(g) => {
                assert_eq!(g.row_count(), 3);
                assert_eq!(g.column_count(), 2);
                assert_eq!(g.rows[2], vec!["Pear", "12"]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!((frags[0].confidence - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn aligned_extractor_ignores_two_row_blocks() {
        let primitives = PagePrimitives {
            glyph_runs: vec![
                run("Item", 72.0, 100.0),
                run("Qty", 200.0, 100.0),
                run("Apple", 72.0, 114.0),
                run("3", 200.0, 114.0),
            ],
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = AlignedTableExtractor::default().extract(&page).await.unwrap();
        assert!(frags.is_empty());
    }

    #[tokio::test]
    async fn aligned_extractor_splits_runs_on_multi_space_gaps() {
        let primitives = PagePrimitives {
            glyph_runs: vec![
                run("Item      Qty", 72.0, 100.0),
                run("Apple     3", 72.0, 114.0),
                run("Pear      12", 72.0, 128.0),
            ],
            ..Default::default()
        };
        let page = PageHandle::from_primitives(0, 612.0, 792.0, primitives);
        let frags = AlignedTableExtractor::default().extract(&page).await.unwrap();
        assert_eq!(frags.len(), 1);
        match &frags[0].payload {
            FragmentPayload::Table(g) => assert_eq!(g.rows[0], vec!["Item", "Qty"]),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
