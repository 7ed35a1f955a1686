//! Per-page driver.
//!
//! One call to [`PageRunner::run`] takes a page from handle to
//! [`PageOutcome`]:
//!
//! ```text
//! PageHandle ──▶ extractors (concurrent, each under a timeout) ──▶ join
//!            ──▶ classify ──▶ OCR (flagged images only) ──▶ fuse ──▶ assess
//! ```
//!
//! The handle is dropped as soon as the extractors have joined, so a page's
//! decoded content never outlives its extraction window.

use crate::config::PipelineConfig;
use crate::error::ExtractorFailure;
use crate::extractors::{Extractor, ExtractorSet, PrecedenceRanking};
use crate::fragment::{FragmentId, RawFragment};
use crate::output::PageOutcome;
use crate::pipeline::classify::Classifier;
use crate::pipeline::fusion::FusionEngine;
use crate::pipeline::ocr::{OcrEngine, OcrStage};
use crate::pipeline::quality::{PageQualityInput, QualityAssessor};
use crate::pipeline::split::PageHandle;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything one page run produced.
#[derive(Debug, Clone, Default)]
pub struct PageRun {
    pub outcome: PageOutcome,
    pub all_extractors_failed: bool,
    pub extractor_calls: usize,
    pub extractor_failures: usize,
    pub ocr_calls: usize,
    pub ocr_failures: usize,
}

/// Shared, immutable state for running pages. Cheap to share behind an
/// `Arc` across page tasks.
pub struct PageRunner {
    extractors: ExtractorSet,
    ranking: PrecedenceRanking,
    ocr: Option<Arc<dyn OcrEngine>>,
    config: Arc<PipelineConfig>,
    timeout: Duration,
}

impl PageRunner {
    pub fn new(
        extractors: ExtractorSet,
        ocr: Option<Arc<dyn OcrEngine>>,
        config: Arc<PipelineConfig>,
        timeout: Duration,
    ) -> Self {
        let ranking = extractors.ranking(&config.extractor_precedence);
        Self {
            extractors,
            ranking,
            ocr,
            config,
            timeout,
        }
    }

    /// Run one page to completion. Never fails: every page-scoped problem
    /// ends up as an issue on the outcome.
    pub async fn run(&self, page: PageHandle) -> PageRun {
        let index = page.index();
        let (width, height, hints) = (page.width(), page.height(), page.hints());
        let start = Instant::now();

        // ── Fan out ──────────────────────────────────────────────────────
        let calls = self.extractors.iter().map(|e| self.call(e, &page));
        let results = join_all(calls).await;
        drop(page);

        let mut fragments: Vec<RawFragment> = Vec::new();
        let mut failures: Vec<ExtractorFailure> = Vec::new();
        for result in results {
            match result {
                Ok(batch) => {
                    for mut f in batch {
                        f.id = FragmentId {
                            page: index,
                            seq: fragments.len(),
                        };
                        fragments.push(f);
                    }
                }
                Err(failure) => {
                    warn!("{}", failure);
                    failures.push(failure);
                }
            }
        }
        debug!(
            "Page {}: {} fragments from {} extractors ({} failed) in {}ms",
            index + 1,
            fragments.len(),
            self.extractors.len(),
            failures.len(),
            start.elapsed().as_millis()
        );

        // ── Classify, OCR, fuse ──────────────────────────────────────────
        let classified = Classifier::from_config(&self.config).classify(width, height, fragments);

        let ocr = OcrStage::new(
            self.ocr.as_deref(),
            self.config.ocr_confidence_floor,
            self.timeout,
        )
        .run(index + 1, &classified)
        .await;

        let fused = FusionEngine::new(&self.config, &self.ranking).fuse(index, &classified, &ocr.texts);

        // ── Assess ───────────────────────────────────────────────────────
        let assessment = QualityAssessor::new(&self.config).assess_page(&PageQualityInput {
            page: index,
            items: &fused.items,
            hints,
            extractors_run: self.extractors.len(),
            extractor_failures: &failures,
            ocr_failures: &ocr.failures,
            fusion_issues: &fused.issues,
        });

        debug!(
            "Page {}: {} items, {} issues in {}ms",
            index + 1,
            fused.items.len(),
            assessment.issues.len(),
            start.elapsed().as_millis()
        );

        PageRun {
            outcome: PageOutcome {
                page: index,
                items: fused.items,
                issues: assessment.issues,
                needs_fallback: assessment.needs_fallback,
                furniture_candidates: fused.furniture_candidates,
            },
            all_extractors_failed: assessment.all_extractors_failed,
            extractor_calls: self.extractors.len(),
            extractor_failures: failures.len(),
            ocr_calls: ocr.calls,
            ocr_failures: ocr.failures.len(),
        }
    }

    /// The outcome for a page whose content could not be decoded at all:
    /// no items, and every extractor reported as failed on it.
    pub fn undecodable(&self, index: usize, detail: &str) -> PageRun {
        let failures: Vec<ExtractorFailure> = self
            .extractors
            .iter()
            .map(|e| ExtractorFailure::ParseError {
                extractor: e.name().to_string(),
                page: index,
                detail: format!("page could not be decoded: {detail}"),
            })
            .collect();
        let assessment = QualityAssessor::new(&self.config).assess_page(&PageQualityInput {
            page: index,
            items: &[],
            hints: Default::default(),
            extractors_run: self.extractors.len(),
            extractor_failures: &failures,
            ocr_failures: &[],
            fusion_issues: &[],
        });
        PageRun {
            outcome: PageOutcome {
                page: index,
                items: Vec::new(),
                issues: assessment.issues,
                needs_fallback: true,
                furniture_candidates: Vec::new(),
            },
            all_extractors_failed: assessment.all_extractors_failed,
            extractor_calls: 0,
            extractor_failures: failures.len(),
            ocr_calls: 0,
            ocr_failures: 0,
        }
    }

    /// One extractor call under the timeout, with its output validated and
    /// stamped.
    async fn call(
        &self,
        extractor: &Arc<dyn Extractor>,
        page: &PageHandle,
    ) -> Result<Vec<RawFragment>, ExtractorFailure> {
        let name = extractor.name();
        let index = page.index();
        let capability = extractor.capability();

        let fragments = match tokio::time::timeout(self.timeout, extractor.extract(page)).await {
            Ok(Ok(fragments)) => fragments,
            Ok(Err(failure)) => return Err(failure.stamped(name, index)),
            Err(_) => {
                return Err(ExtractorFailure::Timeout {
                    extractor: name.to_string(),
                    page: index,
                    elapsed_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        if let Some(bad) = fragments.iter().find(|f| f.capability() != capability) {
            return Err(ExtractorFailure::ParseError {
                extractor: name.to_string(),
                page: index,
                detail: format!(
                    "declared {:?} but returned a {:?} fragment",
                    capability,
                    bad.capability()
                ),
            });
        }

        Ok(fragments
            .into_iter()
            .map(|mut f| {
                f.source = name.to_string();
                f.id.page = index;
                f.confidence = if f.confidence.is_nan() {
                    0.0
                } else {
                    f.confidence.clamp(0.0, 1.0)
                };
                f
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OcrFailure;
    use crate::fragment::{Capability, ImageRegion};
    use crate::geometry::BoundingBox;
    use crate::output::QualityIssue;
    use crate::pipeline::ocr::OcrOutput;
    use async_trait::async_trait;

    struct Lines(&'static str, Vec<(&'static str, f32)>);

    #[async_trait]
    impl Extractor for Lines {
        fn name(&self) -> &str {
            self.0
        }
        fn capability(&self) -> Capability {
            Capability::Text
        }
        async fn extract(&self, _page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
            Ok(self
                .1
                .iter()
                .enumerate()
                .map(|(i, (s, c))| {
                    let top = 100.0 + 20.0 * i as f32;
                    RawFragment::text(BoundingBox::new(72.0, top, 300.0, top + 12.0), *s, Some(12.0), *c)
                })
                .collect())
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Extractor for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }
        fn capability(&self) -> Capability {
            Capability::Table
        }
        async fn extract(&self, _page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    struct Liar;

    #[async_trait]
    impl Extractor for Liar {
        fn name(&self) -> &str {
            "liar"
        }
        fn capability(&self) -> Capability {
            Capability::Table
        }
        async fn extract(&self, _page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
            Ok(vec![RawFragment::text(BoundingBox::new(0.0, 0.0, 1.0, 1.0), "x", None, 0.5)])
        }
    }

    struct Chart;

    #[async_trait]
    impl Extractor for Chart {
        fn name(&self) -> &str {
            "chart"
        }
        fn capability(&self) -> Capability {
            Capability::Image
        }
        async fn extract(&self, _page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
            let region = ImageRegion {
                name: "Im1".into(),
                pixel_width: 400,
                pixel_height: 300,
                structure: None,
                png: Some(Arc::from(vec![0u8; 4])),
            };
            Ok(vec![RawFragment::image(BoundingBox::new(72.0, 400.0, 472.0, 700.0), region, 0.8)])
        }
    }

    struct FailingOcr;

    #[async_trait]
    impl OcrEngine for FailingOcr {
        async fn recognize(&self, _region: &ImageRegion) -> Result<OcrOutput, OcrFailure> {
            Err(OcrFailure::Engine { detail: "offline".into() })
        }
    }

    fn runner(set: ExtractorSet, ocr: Option<Arc<dyn OcrEngine>>) -> PageRunner {
        PageRunner::new(set, ocr, Arc::new(PipelineConfig::default()), Duration::from_secs(2))
    }

    fn page() -> PageHandle {
        PageHandle::blank(0, 612.0, 792.0)
    }

    #[tokio::test]
    async fn fragments_are_stamped_and_clamped() {
        let set = ExtractorSet::new().with(Lines("lines", vec![("Hello", 1.7), ("World", f32::NAN)]));
        let run = runner(set, None).run(page()).await;
        let items = &run.outcome.items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].confidence, 1.0);
        assert_eq!(items[1].confidence, 0.0);
        assert_eq!(items[0].canonical_source(), Some("lines"));
        assert_eq!(run.extractor_calls, 1);
        assert!(!run.all_extractors_failed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_extractor_times_out_without_sinking_the_page() {
        let set = ExtractorSet::new()
            .with(Lines("lines", vec![("Hello World", 0.9)]))
            .with(Sleeper);
        let run = runner(set, None).run(page()).await;
        assert_eq!(run.outcome.items.len(), 1);
        assert_eq!(run.extractor_failures, 1);
        assert!(run.outcome.needs_fallback);
        assert_eq!(
            run.outcome.issues,
            vec![QualityIssue::ExtractorFailed {
                page: 0,
                failure: ExtractorFailure::Timeout {
                    extractor: "sleeper".into(),
                    page: 0,
                    elapsed_ms: 2000,
                },
            }]
        );
    }

    #[tokio::test]
    async fn wrong_capability_is_a_parse_error() {
        let run = runner(ExtractorSet::new().with(Liar), None).run(page()).await;
        assert!(run.outcome.items.is_empty());
        assert!(run.all_extractors_failed);
        assert!(matches!(
            run.outcome.issues[0],
            QualityIssue::ExtractorFailed {
                failure: ExtractorFailure::ParseError { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn ocr_failure_keeps_the_image() {
        let run = runner(ExtractorSet::new().with(Chart), Some(Arc::new(FailingOcr)))
            .run(page())
            .await;
        assert_eq!(run.outcome.items.len(), 1);
        assert_eq!(run.ocr_calls, 1);
        assert_eq!(run.ocr_failures, 1);
        assert!(run
            .outcome
            .issues
            .iter()
            .any(|i| matches!(i, QualityIssue::OcrFailed { .. })));
    }
}
