//! OCR Stage: text for data-bearing images.
//!
//! Only fragments the classifier flagged (`ocr_requested`) are sent to the
//! engine; running OCR over every logo and photo costs far more than it
//! returns. Results are keyed by fragment identity so the fusion engine can
//! attach them to the right image without any geometric matching.

use crate::error::OcrFailure;
use crate::fragment::{ClassifiedFragment, FragmentId, FragmentPayload, ImageRegion};
use crate::output::OcrText;
use crate::pipeline::normalize::clean_ocr_text;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What an OCR engine reports for one region.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OcrOutput {
    pub text: String,
    /// Engine-level confidence in `[0, 1]`.
    pub confidence: f32,
    /// Per-character confidences, when the engine reports them.
    pub char_confidences: Vec<f32>,
}

impl OcrOutput {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            char_confidences: Vec::new(),
        }
    }

    pub fn with_char_confidences(mut self, confidences: Vec<f32>) -> Self {
        self.char_confidences = confidences;
        self
    }

    /// Mean per-character confidence, or the engine confidence when no
    /// per-character values were reported. Clamped to `[0, 1]`; NaN is 0.
    pub fn character_confidence(&self) -> f32 {
        let raw = if self.char_confidences.is_empty() {
            self.confidence
        } else {
            self.char_confidences.iter().sum::<f32>() / self.char_confidences.len() as f32
        };
        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 1.0)
        }
    }
}

/// An OCR backend.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use edgequake_pdf_extract::{ImageRegion, OcrEngine, OcrFailure, OcrOutput};
///
/// struct Fixed;
///
/// #[async_trait]
/// impl OcrEngine for Fixed {
///     async fn recognize(&self, _region: &ImageRegion) -> Result<OcrOutput, OcrFailure> {
///         Ok(OcrOutput::new("Revenue 2024", 0.8))
///     }
/// }
/// ```
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "ocr"
    }

    async fn recognize(&self, region: &ImageRegion) -> Result<OcrOutput, OcrFailure>;
}

/// A failed OCR attempt on one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionFailure {
    pub fragment: Option<FragmentId>,
    pub region: String,
    pub failure: OcrFailure,
}

/// Everything the OCR stage produced for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOcr {
    pub texts: BTreeMap<FragmentId, OcrText>,
    pub failures: Vec<RegionFailure>,
    /// Engine calls made (not counting regions skipped for lack of engine).
    pub calls: usize,
}

/// Runs an engine over the flagged fragments of one page.
pub struct OcrStage<'a> {
    engine: Option<&'a dyn OcrEngine>,
    floor: f32,
    timeout: Duration,
}

impl<'a> OcrStage<'a> {
    pub fn new(engine: Option<&'a dyn OcrEngine>, floor: f32, timeout: Duration) -> Self {
        Self {
            engine,
            floor,
            timeout,
        }
    }

    pub async fn run(&self, page_num: usize, fragments: &[ClassifiedFragment]) -> PageOcr {
        let targets: Vec<(FragmentId, &ImageRegion)> = fragments
            .iter()
            .filter(|f| f.ocr_requested)
            .filter_map(|f| match &f.fragment.payload {
                FragmentPayload::Image(region) => Some((f.fragment.id, region)),
                _ => None,
            })
            .collect();

        let mut out = PageOcr::default();
        if targets.is_empty() {
            return out;
        }

        let Some(engine) = self.engine else {
            let names: Vec<&str> = targets.iter().map(|(_, r)| r.name.as_str()).collect();
            debug!(
                "Page {}: {} data-bearing image(s) but no OCR engine configured",
                page_num,
                targets.len()
            );
            out.failures.push(RegionFailure {
                fragment: None,
                region: names.join(","),
                failure: OcrFailure::Unavailable {
                    detail: "no OCR engine configured".into(),
                },
            });
            return out;
        };

        out.calls = targets.len();
        let start = Instant::now();
        let results = join_all(targets.iter().map(|(id, region)| async move {
            // Report the budget rather than the measured time so repeated
            // runs produce identical issues.
            let result = match tokio::time::timeout(self.timeout, engine.recognize(region)).await {
                Ok(r) => r,
                Err(_) => Err(OcrFailure::Timeout {
                    elapsed_ms: self.timeout.as_millis() as u64,
                }),
            };
            (*id, *region, result)
        }))
        .await;
        debug!(
            "Page {}: {} OCR call(s) via {} in {:?}",
            page_num,
            out.calls,
            engine.name(),
            start.elapsed()
        );

        for (id, region, result) in results {
            match result {
                Ok(output) => {
                    let confidence = output.character_confidence();
                    let low_confidence = confidence < self.floor;
                    let text = if low_confidence {
                        String::new()
                    } else {
                        clean_ocr_text(&output.text)
                    };
                    if low_confidence {
                        debug!(
                            "Page {}: OCR of {} below floor ({:.2} < {:.2}); text dropped",
                            page_num, region.name, confidence, self.floor
                        );
                    }
                    out.texts.insert(
                        id,
                        OcrText {
                            text,
                            confidence,
                            low_confidence,
                        },
                    );
                }
                Err(failure) => {
                    warn!("Page {}: OCR of {} failed: {}", page_num, region.name, failure);
                    out.failures.push(RegionFailure {
                        fragment: Some(id),
                        region: region.name.clone(),
                        failure,
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{RawFragment, SemanticRole};
    use crate::geometry::BoundingBox;

    struct Fixed(OcrOutput);

    #[async_trait]
    impl OcrEngine for Fixed {
        async fn recognize(&self, _region: &ImageRegion) -> Result<OcrOutput, OcrFailure> {
            Ok(self.0.clone())
        }
    }

    struct Slow;

    #[async_trait]
    impl OcrEngine for Slow {
        async fn recognize(&self, _region: &ImageRegion) -> Result<OcrOutput, OcrFailure> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(OcrOutput::new("late", 1.0))
        }
    }

    fn image(seq: usize, requested: bool) -> ClassifiedFragment {
        let mut fragment = RawFragment::image(
            BoundingBox::new(0.0, 0.0, 100.0, 100.0),
            ImageRegion {
                name: format!("Im{seq}"),
                pixel_width: 100,
                pixel_height: 100,
                structure: None,
                png: None,
            },
            0.8,
        );
        fragment.id = FragmentId { page: 0, seq };
        ClassifiedFragment {
            fragment,
            role: SemanticRole::Chart,
            reading_order: seq,
            ocr_requested: requested,
            margin: None,
        }
    }

    #[test]
    fn character_confidence_prefers_per_char_mean() {
        let o = OcrOutput::new("ab", 0.9).with_char_confidences(vec![0.2, 0.4]);
        assert!((o.character_confidence() - 0.3).abs() < 1e-6);
        assert_eq!(OcrOutput::new("", f32::NAN).character_confidence(), 0.0);
        assert_eq!(OcrOutput::new("", 1.7).character_confidence(), 1.0);
    }

    #[tokio::test]
    async fn only_flagged_images_are_recognised() {
        let engine = Fixed(OcrOutput::new("```\nQ1 Q2\n```", 0.9));
        let stage = OcrStage::new(Some(&engine), 0.3, Duration::from_secs(1));
        let out = stage.run(1, &[image(0, true), image(1, false)]).await;
        assert_eq!(out.calls, 1);
        assert_eq!(out.texts.len(), 1);
        let t = &out.texts[&FragmentId { page: 0, seq: 0 }];
        assert_eq!(t.text, "Q1 Q2");
        assert!(!t.low_confidence);
    }

    #[tokio::test]
    async fn below_floor_keeps_entry_with_empty_text() {
        let engine = Fixed(OcrOutput::new("garbled", 0.2));
        let stage = OcrStage::new(Some(&engine), 0.3, Duration::from_secs(1));
        let out = stage.run(1, &[image(0, true)]).await;
        let t = &out.texts[&FragmentId { page: 0, seq: 0 }];
        assert!(t.text.is_empty());
        assert!(t.low_confidence);
        assert!((t.confidence - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn missing_engine_reports_one_failure_per_page() {
        let stage = OcrStage::new(None, 0.3, Duration::from_secs(1));
        let out = stage.run(1, &[image(0, true), image(1, true)]).await;
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].region, "Im0,Im1");
        assert!(matches!(out.failures[0].failure, OcrFailure::Unavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out() {
        let stage = OcrStage::new(Some(&Slow), 0.3, Duration::from_millis(100));
        let out = stage.run(1, &[image(0, true)]).await;
        assert!(out.texts.is_empty());
        assert!(matches!(out.failures[0].failure, OcrFailure::Timeout { .. }));
    }
}
