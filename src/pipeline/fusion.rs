//! Fusion Engine: many extractors' guesses → one item per piece of content.
//!
//! ## Grouping
//!
//! Two fragments describe the same content when they have the same
//! capability, compatible roles, and boxes whose IoU reaches the configured
//! threshold. Grouping is transitive (union-find), so three extractors that
//! each overlap their neighbour end up in one group even if the outer two
//! do not overlap each other directly.
//!
//! ## Merge policy
//!
//! | Capability | Canonical payload | Confidence |
//! |------------|-------------------|------------|
//! | text | highest confidence | canonical + bonus per agreeing source, capped |
//! | table | [`TablePolicy`] order, first valid grid | canonical's own, never boosted |
//! | image | highest confidence | canonical's own, penalised when OCR came back below the floor |
//!
//! Every exact tie falls to the extractor ranked earlier in the precedence
//! list, then to the earlier extraction sequence, so the same input always
//! fuses the same way.
//!
//! OCR text reaches an image by fragment identity, never by geometry.

use crate::config::{PipelineConfig, TablePolicy};
use crate::extractors::PrecedenceRanking;
use crate::fragment::{
    Capability, ClassifiedFragment, FragmentId, FragmentPayload, MarginBand, TableGrid,
};
use crate::geometry::BoundingBox;
use crate::output::{
    FurnitureCandidate, FusedContent, FusedItem, OcrText, QualityIssue, SourceContribution,
};
use crate::pipeline::normalize::{furniture_key, similarity_key};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// Share of a text group's box that must lie inside a table for the text to
/// count as that table's cell text.
const ABSORB_COVERAGE: f32 = 0.9;

/// What fusion produced for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusedPage {
    /// Sorted by reading order, which runs densely from 0.
    pub items: Vec<FusedItem>,
    /// `InvalidTableGrid` and `LowConfidenceOcr`.
    pub issues: Vec<QualityIssue>,
    pub furniture_candidates: Vec<FurnitureCandidate>,
    /// Text groups folded into tables.
    pub absorbed_text_groups: usize,
}

/// Merges one page's classified fragments.
pub struct FusionEngine<'a> {
    config: &'a PipelineConfig,
    ranking: &'a PrecedenceRanking,
}

/// A fused group before reading order is assigned.
struct Draft {
    /// Lowest member reading order.
    anchor: usize,
    /// Canonical member's extraction sequence.
    canonical_seq: usize,
    item: FusedItem,
    margin: Option<MarginBand>,
    invalid_grid: bool,
    low_ocr: Option<f32>,
}

impl<'a> FusionEngine<'a> {
    pub fn new(config: &'a PipelineConfig, ranking: &'a PrecedenceRanking) -> Self {
        Self { config, ranking }
    }

    /// Partition fragment indices into groups that describe the same
    /// content. Groups are ordered by their lowest reading order; members
    /// by reading order.
    pub fn group(&self, fragments: &[ClassifiedFragment]) -> Vec<Vec<usize>> {
        let n = fragments.len();
        let mut sets = DisjointSet::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if self.mergeable(&fragments[i], &fragments[j]) {
                    sets.union(i, j);
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            groups.entry(sets.find(i)).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
        for g in &mut groups {
            g.sort_by_key(|&i| fragments[i].reading_order);
        }
        groups.sort_by_key(|g| fragments[g[0]].reading_order);
        groups
    }

    fn mergeable(&self, a: &ClassifiedFragment, b: &ClassifiedFragment) -> bool {
        a.fragment.capability() == b.fragment.capability()
            && a.role.is_compatible_with(b.role)
            && a.fragment.bbox.iou(&b.fragment.bbox) >= self.config.iou_threshold
    }

    /// Fuse one page.
    pub fn fuse(
        &self,
        page: usize,
        fragments: &[ClassifiedFragment],
        ocr: &BTreeMap<FragmentId, OcrText>,
    ) -> FusedPage {
        let groups = self.group(fragments);

        let mut tables: Vec<Draft> = Vec::new();
        let mut others: Vec<Draft> = Vec::new();
        let mut text_groups: Vec<Vec<&ClassifiedFragment>> = Vec::new();
        for g in &groups {
            let members: Vec<&ClassifiedFragment> = g.iter().map(|&i| &fragments[i]).collect();
            match members[0].fragment.capability() {
                Capability::Table => tables.push(self.fuse_table(page, &members)),
                Capability::Image => others.push(self.fuse_image(page, &members, ocr)),
                Capability::Text => text_groups.push(members),
            }
        }

        let mut absorbed_text_groups = 0;
        for members in text_groups {
            if self.config.absorb_table_text {
                if let Some(table) = host_table(&mut tables, &members) {
                    if let Some(table_key) = table_compact_key(table) {
                        if holds_text(&table_key, &members) {
                            absorb(table, &table_key, &members);
                            absorbed_text_groups += 1;
                            continue;
                        }
                    }
                }
            }
            others.push(self.fuse_text(page, &members));
        }

        let mut drafts = tables;
        drafts.extend(others);
        drafts.sort_by(|a, b| {
            a.anchor
                .cmp(&b.anchor)
                .then(a.canonical_seq.cmp(&b.canonical_seq))
        });

        let mut out = FusedPage {
            absorbed_text_groups,
            ..Default::default()
        };
        for (order, mut draft) in drafts.into_iter().enumerate() {
            draft.item.reading_order = order;
            if draft.invalid_grid {
                out.issues.push(QualityIssue::InvalidTableGrid {
                    page,
                    reading_order: order,
                });
            }
            if let Some(confidence) = draft.low_ocr {
                out.issues.push(QualityIssue::LowConfidenceOcr {
                    page,
                    reading_order: order,
                    confidence,
                });
            }
            if let (Some(band), Some(text)) = (draft.margin, draft.item.text()) {
                out.furniture_candidates.push(FurnitureCandidate {
                    reading_order: order,
                    band,
                    key: furniture_key(text),
                });
            }
            out.items.push(draft.item);
        }

        debug!(
            "Page {}: {} fragments fused into {} items ({} text groups inside tables)",
            page + 1,
            fragments.len(),
            out.items.len(),
            absorbed_text_groups
        );
        out
    }

    // ── Per-capability merges ────────────────────────────────────────────

    fn fuse_text(&self, page: usize, members: &[&ClassifiedFragment]) -> Draft {
        let canonical = self.most_confident(members);
        let canon_text = members[canonical].fragment.text_content().unwrap_or_default();
        let canon_key = similarity_key(canon_text);
        let bonus = &self.config.agreement;

        let sources = self.contributions(members, canonical, |other| {
            let other_key = similarity_key(other.fragment.text_content().unwrap_or_default());
            text_similarity(&canon_key, &other_key) >= bonus.similarity_threshold
        });
        let agreeing = sources.iter().filter(|s| !s.canonical && s.agrees).count();

        let base = members[canonical].fragment.confidence;
        let confidence =
            (base + bonus.per_source * agreeing as f32).min(bonus.max_total.max(base));

        self.draft(
            page,
            members,
            canonical,
            sources,
            confidence,
            FusedContent::Text {
                text: canon_text.to_string(),
            },
        )
    }

    fn fuse_table(&self, page: usize, members: &[&ClassifiedFragment]) -> Draft {
        let mut order: Vec<usize> = (0..members.len()).collect();
        order.sort_by(|&a, &b| self.table_order(members[a], members[b]));

        let grid_of = |i: usize| match &members[i].fragment.payload {
            FragmentPayload::Table(g) => Some(g),
            _ => None,
        };
        let valid = order
            .iter()
            .copied()
            .find(|&i| grid_of(i).is_some_and(TableGrid::is_valid));
        let (canonical, invalid_grid) = match valid {
            Some(i) => (i, false),
            None => (self.most_confident(members), true),
        };

        let canon_grid = grid_of(canonical).cloned().unwrap_or_default();
        let canon_key = similarity_key(&grid_text(&canon_grid));
        let threshold = self.config.agreement.similarity_threshold;
        let sources = self.contributions(members, canonical, |other| match &other.fragment.payload {
            FragmentPayload::Table(g) => {
                g.row_count() == canon_grid.row_count()
                    && g.column_count() == canon_grid.column_count()
                    && text_similarity(&canon_key, &similarity_key(&grid_text(g))) >= threshold
            }
            _ => false,
        });

        let confidence = members[canonical].fragment.confidence;
        let mut draft = self.draft(
            page,
            members,
            canonical,
            sources,
            confidence,
            FusedContent::Table {
                row_count: canon_grid.row_count(),
                column_count: canon_grid.rows.iter().map(Vec::len).max().unwrap_or(0),
                rows: canon_grid.rows,
            },
        );
        draft.invalid_grid = invalid_grid;
        draft
    }

    fn fuse_image(
        &self,
        page: usize,
        members: &[&ClassifiedFragment],
        ocr: &BTreeMap<FragmentId, OcrText>,
    ) -> Draft {
        let canonical = self.most_confident(members);
        let canon = members[canonical];
        let ocr_text = ocr.get(&canon.fragment.id).cloned().or_else(|| {
            members
                .iter()
                .find_map(|m| ocr.get(&m.fragment.id).cloned())
        });

        let (name, pixel_width, pixel_height) = match &canon.fragment.payload {
            FragmentPayload::Image(r) => (r.name.clone(), r.pixel_width, r.pixel_height),
            _ => (String::new(), 0, 0),
        };
        let sources = self.contributions(members, canonical, |other| match &other.fragment.payload {
            FragmentPayload::Image(r) => r.pixel_width == pixel_width && r.pixel_height == pixel_height,
            _ => false,
        });

        let mut confidence = canon.fragment.confidence;
        let low_ocr = ocr_text
            .as_ref()
            .filter(|t| t.low_confidence)
            .map(|t| t.confidence);
        if low_ocr.is_some() {
            confidence *= self.config.low_ocr_image_penalty;
        }

        let mut draft = self.draft(
            page,
            members,
            canonical,
            sources,
            confidence,
            FusedContent::Image {
                name,
                pixel_width,
                pixel_height,
                ocr: ocr_text,
            },
        );
        draft.low_ocr = low_ocr;
        draft
    }

    // ── Shared helpers ───────────────────────────────────────────────────

    /// Ordering for "who wins": higher confidence, then earlier precedence,
    /// then earlier extraction sequence.
    fn by_confidence(&self, a: &ClassifiedFragment, b: &ClassifiedFragment) -> Ordering {
        b.fragment
            .confidence
            .total_cmp(&a.fragment.confidence)
            .then_with(|| self.by_precedence(a, b))
    }

    fn by_precedence(&self, a: &ClassifiedFragment, b: &ClassifiedFragment) -> Ordering {
        self.ranking
            .rank(&a.fragment.source)
            .cmp(&self.ranking.rank(&b.fragment.source))
            .then(a.fragment.id.seq.cmp(&b.fragment.id.seq))
    }

    fn table_order(&self, a: &ClassifiedFragment, b: &ClassifiedFragment) -> Ordering {
        match self.config.table_policy {
            TablePolicy::PrecedenceFirst => self
                .ranking
                .rank(&a.fragment.source)
                .cmp(&self.ranking.rank(&b.fragment.source))
                .then(b.fragment.confidence.total_cmp(&a.fragment.confidence))
                .then(a.fragment.id.seq.cmp(&b.fragment.id.seq)),
            TablePolicy::ConfidenceFirst => self.by_confidence(a, b),
        }
    }

    fn most_confident(&self, members: &[&ClassifiedFragment]) -> usize {
        let mut best = 0;
        for i in 1..members.len() {
            if self.by_confidence(members[i], members[best]) == Ordering::Less {
                best = i;
            }
        }
        best
    }

    /// Canonical source first, then one entry per other extractor in
    /// precedence order. Extra fragments from the canonical's own extractor
    /// are not listed; several from another extractor collapse into one
    /// entry that agrees if any of them does.
    fn contributions(
        &self,
        members: &[&ClassifiedFragment],
        canonical: usize,
        mut agrees: impl FnMut(&ClassifiedFragment) -> bool,
    ) -> Vec<SourceContribution> {
        let mut rest: Vec<usize> = (0..members.len()).filter(|&i| i != canonical).collect();
        rest.sort_by(|&a, &b| self.by_precedence(members[a], members[b]));

        let mut sources = vec![SourceContribution {
            extractor: members[canonical].fragment.source.clone(),
            confidence: members[canonical].fragment.confidence,
            canonical: true,
            agrees: true,
        }];
        for i in rest {
            let m = members[i];
            if m.fragment.source == sources[0].extractor {
                continue;
            }
            let agreed = agrees(m);
            match sources.iter_mut().find(|s| s.extractor == m.fragment.source) {
                Some(s) => {
                    s.confidence = s.confidence.max(m.fragment.confidence);
                    s.agrees |= agreed;
                }
                None => sources.push(SourceContribution {
                    extractor: m.fragment.source.clone(),
                    confidence: m.fragment.confidence,
                    canonical: false,
                    agrees: agreed,
                }),
            }
        }
        sources
    }

    fn draft(
        &self,
        page: usize,
        members: &[&ClassifiedFragment],
        canonical: usize,
        sources: Vec<SourceContribution>,
        confidence: f32,
        content: FusedContent,
    ) -> Draft {
        let canon = members[canonical];
        let bbox = BoundingBox::enclosing(members.iter().map(|m| &m.fragment.bbox))
            .unwrap_or(canon.fragment.bbox);
        Draft {
            anchor: members.iter().map(|m| m.reading_order).min().unwrap_or(0),
            canonical_seq: canon.fragment.id.seq,
            margin: canon.margin,
            invalid_grid: false,
            low_ocr: None,
            item: FusedItem {
                page,
                reading_order: 0,
                role: canon.role,
                bbox,
                confidence: clamp_unit(confidence),
                sources,
                content,
            },
        }
    }
}

/// The table whose box holds most of the text group, if any holds at least
/// [`ABSORB_COVERAGE`] of it.
fn host_table<'d>(tables: &'d mut [Draft], members: &[&ClassifiedFragment]) -> Option<&'d mut Draft> {
    let bbox = BoundingBox::enclosing(members.iter().map(|m| &m.fragment.bbox))?;
    let area = bbox.area();
    if area <= 0.0 {
        return None;
    }
    let mut best: Option<(usize, f32)> = None;
    for (i, t) in tables.iter().enumerate() {
        let coverage = bbox.intersection_area(&t.item.bbox) / area;
        if coverage >= ABSORB_COVERAGE && best.map_or(true, |(_, c)| coverage > c) {
            best = Some((i, coverage));
        }
    }
    let (i, _) = best?;
    Some(&mut tables[i])
}

/// The table's cell text as a comparison key with all whitespace removed.
fn table_compact_key(table: &Draft) -> Option<String> {
    match &table.item.content {
        FusedContent::Table { rows, .. } => Some(compact_key(&grid_text(&TableGrid::new(
            rows.clone(),
        )))),
        _ => None,
    }
}

fn compact_key(text: &str) -> String {
    similarity_key(text).split_whitespace().collect()
}

/// Whether any extractor's reading of the group appears in the table text.
fn holds_text(table_key: &str, members: &[&ClassifiedFragment]) -> bool {
    members
        .iter()
        .any(|m| table_key.contains(&compact_key(m.fragment.text_content().unwrap_or_default())))
}

/// Record a text group as table cell text: one non-canonical contribution
/// per extractor, at that extractor's lowest confidence, agreeing only if
/// every line it saw appears in the table.
fn absorb(table: &mut Draft, table_key: &str, members: &[&ClassifiedFragment]) {
    for m in members {
        let text_key = compact_key(m.fragment.text_content().unwrap_or_default());
        let found = table_key.contains(&text_key);
        let existing = table
            .item
            .sources
            .iter_mut()
            .find(|s| !s.canonical && s.extractor == m.fragment.source);
        match existing {
            Some(s) => {
                s.confidence = s.confidence.min(m.fragment.confidence);
                s.agrees &= found;
            }
            _ => table.item.sources.push(SourceContribution {
                extractor: m.fragment.source.clone(),
                confidence: m.fragment.confidence,
                canonical: false,
                agrees: found,
            }),
        }
    }
}

fn grid_text(grid: &TableGrid) -> String {
    grid.rows
        .iter()
        .map(|r| r.join(" "))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalised Levenshtein similarity of two comparison keys.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    strsim::normalized_levenshtein(a, b) as f32
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Union-find with path halving.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}
