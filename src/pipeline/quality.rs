//! Quality Assessor: per-category scores, overall fidelity, issue flags.
//!
//! Page-level checks run as each page finishes ([`QualityAssessor::assess_page`]),
//! so a streamed page already carries its issues. Scores need every item and
//! are computed once the aggregator has the whole (or partial) document
//! ([`QualityAssessor::assess_document`]).

use crate::config::PipelineConfig;
use crate::error::ExtractorFailure;
use crate::fragment::Capability;
use crate::output::{CategoryScores, ExtractionQuality, FusedItem, QualityIssue};
use crate::pipeline::ocr::RegionFailure;
use crate::pipeline::split::PageHints;

/// What the assessor needs to know about one finished page.
#[derive(Debug, Clone, Copy)]
pub struct PageQualityInput<'a> {
    pub page: usize,
    /// The page's fused items, in reading order.
    pub items: &'a [FusedItem],
    pub hints: PageHints,
    /// Extractors that ran on the page.
    pub extractors_run: usize,
    pub extractor_failures: &'a [ExtractorFailure],
    pub ocr_failures: &'a [RegionFailure],
    /// `InvalidTableGrid` / `LowConfidenceOcr` raised during fusion.
    pub fusion_issues: &'a [QualityIssue],
}

/// Issues for one page and whether its content is known to be incomplete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageAssessment {
    pub issues: Vec<QualityIssue>,
    pub needs_fallback: bool,
    /// Every extractor failed on this page.
    pub all_extractors_failed: bool,
}

/// Scores and flags extraction results.
#[derive(Debug, Clone, Copy)]
pub struct QualityAssessor<'a> {
    config: &'a PipelineConfig,
}

impl<'a> QualityAssessor<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Page-level issues, in a fixed order: extractor failures, fusion
    /// issues, OCR failures, items below their floor, missing categories.
    pub fn assess_page(&self, input: &PageQualityInput<'_>) -> PageAssessment {
        let page = input.page;
        let mut issues: Vec<QualityIssue> = input
            .extractor_failures
            .iter()
            .map(|f| QualityIssue::ExtractorFailed {
                page,
                failure: f.clone(),
            })
            .collect();

        issues.extend(input.fusion_issues.iter().cloned());

        issues.extend(input.ocr_failures.iter().map(|f| QualityIssue::OcrFailed {
            page,
            region: f.region.clone(),
            failure: f.failure.clone(),
        }));

        for item in input.items {
            let category = item.category();
            let floor = self.config.floors.get(category);
            if item.confidence < floor {
                issues.push(QualityIssue::BelowFloor {
                    page,
                    reading_order: item.reading_order,
                    category,
                    confidence: item.confidence,
                    floor,
                });
            }
        }

        let has = |c: Capability| input.items.iter().any(|i| i.category() == c);
        // Table cells carry the page's text, so a page of nothing but tables
        // is not missing text.
        let mut missing = Vec::new();
        if input.hints.has_text && !has(Capability::Text) && !has(Capability::Table) {
            missing.push(Capability::Text);
        }
        if input.hints.has_ruled_grid && !has(Capability::Table) {
            missing.push(Capability::Table);
        }
        if input.hints.draws_images && !has(Capability::Image) {
            missing.push(Capability::Image);
        }
        let any_missing = !missing.is_empty();
        issues.extend(
            missing
                .into_iter()
                .map(|category| QualityIssue::MissingCategory { page, category }),
        );

        let all_extractors_failed =
            input.extractors_run > 0 && input.extractor_failures.len() >= input.extractors_run;
        PageAssessment {
            issues,
            needs_fallback: any_missing || !input.extractor_failures.is_empty(),
            all_extractors_failed,
        }
    }

    /// Document-level report over every included page.
    ///
    /// * `page_issues` – concatenated page issues, in page order
    /// * `fallback_pages` – pages whose assessment needed a fallback
    /// * `any_page_failed` – some page lost every extractor
    /// * `cancelled_after` – set when the run was cancelled
    pub fn assess_document(
        &self,
        items: &[FusedItem],
        page_issues: Vec<QualityIssue>,
        fallback_pages: Vec<usize>,
        any_page_failed: bool,
        cancelled_after: Option<usize>,
    ) -> ExtractionQuality {
        let scores = category_scores(items);
        let overall_fidelity = overall_fidelity(&scores, self.config);

        let mut issues = page_issues;
        if let Some(pages_completed) = cancelled_after {
            issues.push(QualityIssue::Cancelled { pages_completed });
        }

        ExtractionQuality {
            scores,
            overall_fidelity,
            issues,
            needs_fallback: overall_fidelity < self.config.fallback_threshold || any_page_failed,
            fallback_pages,
        }
    }
}

/// Confidence-weighted mean per category: `Σc² / Σc`.
pub fn category_scores(items: &[FusedItem]) -> CategoryScores {
    let score = |category: Capability| -> Option<f32> {
        let (mut sum, mut sum_sq, mut n) = (0.0f64, 0.0f64, 0usize);
        for item in items.iter().filter(|i| i.category() == category) {
            let c = f64::from(item.confidence);
            sum += c;
            sum_sq += c * c;
            n += 1;
        }
        match n {
            0 => None,
            _ if sum <= 0.0 => Some(0.0),
            _ => Some((sum_sq / sum) as f32),
        }
    };
    CategoryScores {
        text_confidence: score(Capability::Text),
        table_accuracy: score(Capability::Table),
        image_relevance: score(Capability::Image),
    }
}

/// Weighted mean of the defined category scores; weights of undefined
/// categories are dropped and the rest renormalised. `0.0` when nothing is
/// defined or every remaining weight is zero.
pub fn overall_fidelity(scores: &CategoryScores, config: &PipelineConfig) -> f32 {
    let (mut weighted, mut total) = (0.0f32, 0.0f32);
    for category in Capability::ALL {
        if let Some(score) = scores.get(category) {
            let w = config.category_weights.get(category);
            weighted += w * score;
            total += w;
        }
    }
    if total > 0.0 {
        (weighted / total).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryWeights;
    use crate::error::OcrFailure;
    use crate::fragment::SemanticRole;
    use crate::geometry::BoundingBox;
    use crate::output::FusedContent;

    fn item(order: usize, content: FusedContent, confidence: f32) -> FusedItem {
        FusedItem {
            page: 0,
            reading_order: order,
            role: SemanticRole::Paragraph,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            confidence,
            sources: vec![],
            content,
        }
    }

    fn text_item(order: usize, confidence: f32) -> FusedItem {
        item(order, FusedContent::Text { text: "x".into() }, confidence)
    }

    fn table_item(order: usize, confidence: f32) -> FusedItem {
        item(
            order,
            FusedContent::Table {
                rows: vec![vec!["a".into()]],
                row_count: 1,
                column_count: 1,
            },
            confidence,
        )
    }

    fn input<'a>(items: &'a [FusedItem], hints: PageHints) -> PageQualityInput<'a> {
        PageQualityInput {
            page: 0,
            items,
            hints,
            extractors_run: 4,
            extractor_failures: &[],
            ocr_failures: &[],
            fusion_issues: &[],
        }
    }

    #[test]
    fn single_text_item_drives_everything() {
        let cfg = PipelineConfig::default();
        let items = vec![text_item(0, 0.9)];
        let scores = category_scores(&items);
        assert!((scores.text_confidence.unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(scores.table_accuracy, None);
        assert_eq!(scores.image_relevance, None);
        assert!((overall_fidelity(&scores, &cfg) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn confident_items_weigh_more() {
        let scores = category_scores(&[text_item(0, 1.0), text_item(1, 0.2)]);
        // (1.0 + 0.04) / 1.2
        assert!((scores.text_confidence.unwrap() - 0.866_666_7).abs() < 1e-5);
    }

    #[test]
    fn zero_confidence_items_score_zero() {
        let scores = category_scores(&[text_item(0, 0.0)]);
        assert_eq!(scores.text_confidence, Some(0.0));
    }

    #[test]
    fn weights_are_renormalised_over_defined_categories() {
        let mut cfg = PipelineConfig::default();
        cfg.category_weights = CategoryWeights {
            text: 1.0,
            table: 3.0,
            image: 10.0,
        };
        let scores = category_scores(&[text_item(0, 0.8), table_item(1, 0.4)]);
        // (0.8·1 + 0.4·3) / 4
        assert!((overall_fidelity(&scores, &cfg) - 0.5).abs() < 1e-6);
        assert_eq!(overall_fidelity(&CategoryScores::default(), &cfg), 0.0);
    }

    #[test]
    fn below_floor_items_are_flagged() {
        let cfg = PipelineConfig::default();
        let items = vec![text_item(0, 0.45), table_item(1, 0.45)];
        let a = QualityAssessor::new(&cfg).assess_page(&input(&items, PageHints::default()));
        assert_eq!(
            a.issues,
            vec![QualityIssue::BelowFloor {
                page: 0,
                reading_order: 0,
                category: Capability::Text,
                confidence: 0.45,
                floor: 0.5,
            }]
        );
        assert!(!a.needs_fallback);
    }

    #[test]
    fn missing_categories_follow_hints() {
        let cfg = PipelineConfig::default();
        let hints = PageHints {
            has_text: true,
            draws_images: true,
            has_ruled_grid: true,
        };
        let a = QualityAssessor::new(&cfg).assess_page(&input(&[], hints));
        let missing: Vec<Capability> = a
            .issues
            .iter()
            .filter_map(|i| match i {
                QualityIssue::MissingCategory { category, .. } => Some(*category),
                _ => None,
            })
            .collect();
        assert_eq!(missing, vec![Capability::Text, Capability::Table, Capability::Image]);
        assert!(a.needs_fallback);
    }

    #[test]
    fn tables_satisfy_expected_text() {
        let cfg = PipelineConfig::default();
        let hints = PageHints {
            has_text: true,
            ..Default::default()
        };
        let items = vec![table_item(0, 0.9)];
        let a = QualityAssessor::new(&cfg).assess_page(&input(&items, hints));
        assert!(a.issues.is_empty());
    }

    #[test]
    fn failures_are_reported_in_order() {
        let cfg = PipelineConfig::default();
        let items = vec![text_item(0, 0.9)];
        let failures = vec![ExtractorFailure::Timeout {
            extractor: "cloud".into(),
            page: 0,
            elapsed_ms: 100,
        }];
        let ocr = vec![RegionFailure {
            fragment: None,
            region: "Im0".into(),
            failure: OcrFailure::Engine { detail: "boom".into() },
        }];
        let mut i = input(&items, PageHints::default());
        i.extractor_failures = &failures;
        i.ocr_failures = &ocr;
        let a = QualityAssessor::new(&cfg).assess_page(&i);
        assert!(matches!(a.issues[0], QualityIssue::ExtractorFailed { .. }));
        assert!(matches!(a.issues[1], QualityIssue::OcrFailed { .. }));
        assert!(a.needs_fallback);
        assert!(!a.all_extractors_failed);
    }

    #[test]
    fn document_report_sets_fallback_and_cancellation() {
        let cfg = PipelineConfig::default();
        let assessor = QualityAssessor::new(&cfg);
        let q = assessor.assess_document(&[text_item(0, 0.9)], vec![], vec![], false, None);
        assert!(!q.needs_fallback);

        let q = assessor.assess_document(&[text_item(0, 0.3)], vec![], vec![], false, Some(2));
        assert!(q.needs_fallback);
        assert_eq!(q.issues, vec![QualityIssue::Cancelled { pages_completed: 2 }]);

        let q = assessor.assess_document(&[text_item(0, 0.9)], vec![], vec![3], true, None);
        assert!(q.needs_fallback);
        assert_eq!(q.fallback_pages, vec![3]);
    }
}
