//! Configuration types for the extraction pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share a config across page tasks, serialise it next to a result,
//! and diff two runs to understand why their outputs differ.
//!
//! The config also round-trips through JSON, which is how the `pdfx` CLI
//! loads `--config` files.

use crate::error::ExtractError;
use crate::extractors::builtin_names;
use crate::fragment::Capability;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Configuration for one extraction run.
///
/// # Example
/// ```rust
/// use edgequake_pdf_extract::{PipelineConfig, TablePolicy};
///
/// let config = PipelineConfig::builder()
///     .page_concurrency(8)
///     .iou_threshold(0.5)
///     .table_policy(TablePolicy::ConfidenceFirst)
///     .build()
///     .unwrap();
/// assert_eq!(config.page_concurrency, 8);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pages processed at the same time. Default: 4.
    ///
    /// Peak memory is roughly this many page footprints, and the reorder
    /// buffer in the aggregator never holds more than this many results.
    pub page_concurrency: usize,

    /// Minimum IoU for two same-type fragments to be merged. Default: 0.6.
    pub iou_threshold: f32,

    /// Confidence bonus for corroborated text.
    pub agreement: AgreementBonus,

    /// Per-category confidence floors for quality flagging.
    pub floors: ConfidenceFloors,

    /// OCR results below this confidence are discarded (text emptied) and
    /// flagged. Default: 0.3.
    pub ocr_confidence_floor: f32,

    /// Images whose extractor confidence exceeds this are data-bearing and
    /// sent to OCR. Default: 0.5.
    pub ocr_trigger_threshold: f32,

    /// Extractor names, most trusted first. Used for table precedence and
    /// for every exact-confidence tie-break.
    pub extractor_precedence: Vec<String>,

    /// How conflicting table grids are resolved. Default: precedence first.
    pub table_policy: TablePolicy,

    /// Weights of the category scores in the overall fidelity.
    pub category_weights: CategoryWeights,

    /// Per-extractor (and per-OCR) call timeout.
    pub timeout: TimeoutPolicy,

    /// Factor applied to an image's confidence when its OCR came back below
    /// the OCR floor. Default: 0.75.
    pub low_ocr_image_penalty: f32,

    /// Overall fidelity below which the result is marked as needing a
    /// fallback. Default: 0.5.
    pub fallback_threshold: f32,

    /// Height of a reading-order band in points. `None` derives it from the
    /// page's median text height.
    pub reading_band_height: Option<f32>,

    /// Fold text lines that lie inside a fused table into that table's
    /// sources instead of emitting them twice. Default: true.
    pub absorb_table_text: bool,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Page separator used by Markdown assembly.
    pub page_separator: PageSeparator,

    /// Prepend YAML front matter in Markdown assembly. Default: false.
    pub include_metadata: bool,

    /// Optional progress observer.
    #[serde(skip)]
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_concurrency: 4,
            iou_threshold: 0.6,
            agreement: AgreementBonus::default(),
            floors: ConfidenceFloors::default(),
            ocr_confidence_floor: 0.3,
            ocr_trigger_threshold: 0.5,
            extractor_precedence: builtin_names().iter().map(|s| s.to_string()).collect(),
            table_policy: TablePolicy::default(),
            category_weights: CategoryWeights::default(),
            timeout: TimeoutPolicy::default(),
            low_ocr_image_penalty: 0.75,
            fallback_threshold: 0.5,
            reading_band_height: None,
            absorb_table_text: true,
            pages: PageSelection::default(),
            page_separator: PageSeparator::default(),
            include_metadata: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("page_concurrency", &self.page_concurrency)
            .field("iou_threshold", &self.iou_threshold)
            .field("agreement", &self.agreement)
            .field("floors", &self.floors)
            .field("ocr_confidence_floor", &self.ocr_confidence_floor)
            .field("ocr_trigger_threshold", &self.ocr_trigger_threshold)
            .field("extractor_precedence", &self.extractor_precedence)
            .field("table_policy", &self.table_policy)
            .field("category_weights", &self.category_weights)
            .field("timeout", &self.timeout)
            .field("low_ocr_image_penalty", &self.low_ocr_image_penalty)
            .field("fallback_threshold", &self.fallback_threshold)
            .field("reading_band_height", &self.reading_band_height)
            .field("absorb_table_text", &self.absorb_table_text)
            .field("pages", &self.pages)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// A builder seeded with this configuration, e.g. one loaded from JSON
    /// that command-line flags then override.
    pub fn to_builder(&self) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: self.clone(),
        }
    }

    /// Load a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ExtractError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExtractError::InvalidConfig(format!("config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges. Called by [`PipelineConfigBuilder::build`].
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.page_concurrency == 0 {
            return Err(ExtractError::InvalidConfig(
                "page_concurrency must be ≥ 1".into(),
            ));
        }
        let unit = [
            ("iou_threshold", self.iou_threshold),
            ("ocr_confidence_floor", self.ocr_confidence_floor),
            ("ocr_trigger_threshold", self.ocr_trigger_threshold),
            ("low_ocr_image_penalty", self.low_ocr_image_penalty),
            ("fallback_threshold", self.fallback_threshold),
            ("agreement.per_source", self.agreement.per_source),
            ("agreement.similarity_threshold", self.agreement.similarity_threshold),
            ("agreement.max_total", self.agreement.max_total),
            ("floors.text", self.floors.text),
            ("floors.table", self.floors.table),
            ("floors.image", self.floors.image),
        ];
        for (name, v) in unit {
            if !(0.0..=1.0).contains(&v) {
                return Err(ExtractError::InvalidConfig(format!(
                    "{name} must be within 0–1, got {v}"
                )));
            }
        }
        if self.iou_threshold == 0.0 {
            return Err(ExtractError::InvalidConfig(
                "iou_threshold must be > 0".into(),
            ));
        }
        let w = &self.category_weights;
        if w.text < 0.0 || w.table < 0.0 || w.image < 0.0 {
            return Err(ExtractError::InvalidConfig(
                "category weights must be non-negative".into(),
            ));
        }
        if let Some(h) = self.reading_band_height {
            if h <= 0.0 {
                return Err(ExtractError::InvalidConfig(format!(
                    "reading_band_height must be > 0, got {h}"
                )));
            }
        }
        Ok(())
    }

    /// Position of `extractor` in the precedence list, if listed.
    pub fn precedence_of(&self, extractor: &str) -> Option<usize> {
        self.extractor_precedence.iter().position(|n| n == extractor)
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl fmt::Debug for PipelineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineConfigBuilder {
    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn iou_threshold(mut self, t: f32) -> Self {
        self.config.iou_threshold = t;
        self
    }

    pub fn agreement(mut self, bonus: AgreementBonus) -> Self {
        self.config.agreement = bonus;
        self
    }

    pub fn floors(mut self, floors: ConfidenceFloors) -> Self {
        self.config.floors = floors;
        self
    }

    pub fn ocr_confidence_floor(mut self, floor: f32) -> Self {
        self.config.ocr_confidence_floor = floor;
        self
    }

    pub fn ocr_trigger_threshold(mut self, t: f32) -> Self {
        self.config.ocr_trigger_threshold = t;
        self
    }

    pub fn extractor_precedence<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.extractor_precedence = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn table_policy(mut self, policy: TablePolicy) -> Self {
        self.config.table_policy = policy;
        self
    }

    pub fn category_weights(mut self, weights: CategoryWeights) -> Self {
        self.config.category_weights = weights;
        self
    }

    pub fn timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.config.timeout = policy;
        self
    }

    pub fn low_ocr_image_penalty(mut self, factor: f32) -> Self {
        self.config.low_ocr_image_penalty = factor;
        self
    }

    pub fn fallback_threshold(mut self, t: f32) -> Self {
        self.config.fallback_threshold = t;
        self
    }

    pub fn reading_band_height(mut self, points: f32) -> Self {
        self.config.reading_band_height = Some(points);
        self
    }

    pub fn absorb_table_text(mut self, v: bool) -> Self {
        self.config.absorb_table_text = v;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn include_metadata(mut self, v: bool) -> Self {
        self.config.include_metadata = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ExtractError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Sub-configs ──────────────────────────────────────────────────────────

/// Confidence bonus for text corroborated by other extractors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementBonus {
    /// Added per corroborating source. Default: 0.05.
    pub per_source: f32,
    /// Minimum normalised text similarity to count as agreement. Default: 0.8.
    pub similarity_threshold: f32,
    /// Cap on the combined confidence. Default: 1.0.
    pub max_total: f32,
}

impl Default for AgreementBonus {
    fn default() -> Self {
        Self {
            per_source: 0.05,
            similarity_threshold: 0.8,
            max_total: 1.0,
        }
    }
}

/// Per-category confidence floors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceFloors {
    pub text: f32,
    pub table: f32,
    pub image: f32,
}

impl ConfidenceFloors {
    pub fn get(&self, category: Capability) -> f32 {
        match category {
            Capability::Text => self.text,
            Capability::Table => self.table,
            Capability::Image => self.image,
        }
    }
}

impl Default for ConfidenceFloors {
    fn default() -> Self {
        Self {
            text: 0.5,
            table: 0.4,
            image: 0.3,
        }
    }
}

/// Weights of the category scores in the overall fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryWeights {
    pub text: f32,
    pub table: f32,
    pub image: f32,
}

impl CategoryWeights {
    pub fn get(&self, category: Capability) -> f32 {
        match category {
            Capability::Text => self.text,
            Capability::Table => self.table,
            Capability::Image => self.image,
        }
    }
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self {
            text: 1.0,
            table: 1.0,
            image: 1.0,
        }
    }
}

/// How the fusion engine picks the canonical grid among overlapping tables.
///
/// | Policy | Order of candidates |
/// |--------|---------------------|
/// | `PrecedenceFirst` | precedence rank, then confidence |
/// | `ConfidenceFirst` | confidence, then precedence rank |
///
/// Either way the first candidate with a valid grid wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePolicy {
    /// The extractor listed earliest in the precedence list wins. (default)
    #[default]
    PrecedenceFirst,
    /// The most confident extractor wins.
    ConfidenceFirst,
}

/// Per-call timeout for extractors and OCR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Derived from the page count so the total budget grows with √pages:
    /// `max(min_secs, base_secs · √pages / waves)`, capped at `base_secs`,
    /// where `waves = ⌈pages / page_concurrency⌉`.
    Auto { base_secs: u64, min_secs: u64 },
    /// The same timeout for every call.
    Fixed { millis: u64 },
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Auto {
            base_secs: 60,
            min_secs: 5,
        }
    }
}

impl TimeoutPolicy {
    /// Resolve to a concrete per-call duration.
    pub fn resolve(&self, pages: usize, page_concurrency: usize) -> Duration {
        match *self {
            TimeoutPolicy::Fixed { millis } => Duration::from_millis(millis.max(1)),
            TimeoutPolicy::Auto {
                base_secs,
                min_secs,
            } => {
                let pages = pages.max(1) as f64;
                let waves = (pages / page_concurrency.max(1) as f64).ceil().max(1.0);
                let budget = base_secs as f64 * pages.sqrt();
                let per_call = (budget / waves)
                    .min(base_secs as f64)
                    .max(min_secs as f64);
                Duration::from_secs_f64(per_call)
            }
        }
    }
}

/// Specifies which pages of the PDF to extract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// How to separate pages in assembled Markdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string for the given page number (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.page_concurrency, 4);
        assert!((c.iou_threshold - 0.6).abs() < f32::EPSILON);
        assert!((c.floors.text - 0.5).abs() < f32::EPSILON);
        assert!((c.floors.table - 0.4).abs() < f32::EPSILON);
        assert!((c.floors.image - 0.3).abs() < f32::EPSILON);
        assert!((c.ocr_confidence_floor - 0.3).abs() < f32::EPSILON);
        assert!((c.ocr_trigger_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(c.table_policy, TablePolicy::PrecedenceFirst);
        assert!(!c.extractor_precedence.is_empty());
    }

    #[test]
    fn build_rejects_out_of_range() {
        let err = PipelineConfig::builder().iou_threshold(1.5).build();
        assert!(matches!(err, Err(ExtractError::InvalidConfig(_))));
        let err = PipelineConfig::builder().iou_threshold(0.0).build();
        assert!(matches!(err, Err(ExtractError::InvalidConfig(_))));
    }

    #[test]
    fn concurrency_is_clamped_to_one() {
        let c = PipelineConfig::builder().page_concurrency(0).build().unwrap();
        assert_eq!(c.page_concurrency, 1);
    }

    #[test]
    fn json_roundtrip_with_partial_fields() {
        let c = PipelineConfig::from_json(r#"{"iou_threshold": 0.7, "table_policy": "confidence_first"}"#)
            .unwrap();
        assert!((c.iou_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(c.table_policy, TablePolicy::ConfidenceFirst);
        assert_eq!(c.page_concurrency, 4);
    }

    #[test]
    fn json_rejects_invalid_values() {
        assert!(PipelineConfig::from_json(r#"{"page_concurrency": 0}"#).is_err());
        assert!(PipelineConfig::from_json("not json").is_err());
    }

    #[test]
    fn precedence_lookup() {
        let c = PipelineConfig::builder()
            .extractor_precedence(["a", "b"])
            .build()
            .unwrap();
        assert_eq!(c.precedence_of("b"), Some(1));
        assert_eq!(c.precedence_of("z"), None);
    }

    #[test]
    fn auto_timeout_single_page_is_base() {
        let t = TimeoutPolicy::default().resolve(1, 4);
        assert_eq!(t, Duration::from_secs(60));
    }

    #[test]
    fn auto_timeout_shrinks_per_call_but_budget_grows_sublinearly() {
        let policy = TimeoutPolicy::default();
        let t100 = policy.resolve(100, 4).as_secs_f64();
        let t400 = policy.resolve(400, 4).as_secs_f64();
        assert!(t400 < t100);
        let budget100 = t100 * 25.0;
        let budget400 = t400 * 100.0;
        assert!(budget400 > budget100);
        assert!(budget400 < budget100 * 4.0);
    }

    #[test]
    fn auto_timeout_respects_floor() {
        let t = TimeoutPolicy::Auto {
            base_secs: 60,
            min_secs: 5,
        }
        .resolve(1_000_000, 1);
        assert_eq!(t, Duration::from_secs(5));
    }

    #[test]
    fn fixed_timeout() {
        let t = TimeoutPolicy::Fixed { millis: 250 }.resolve(10, 2);
        assert_eq!(t, Duration::from_millis(250));
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 4).to_indices(5), vec![1, 2, 3]);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).to_indices(5),
            vec![0, 2]
        );
    }

    #[test]
    fn separator_render() {
        assert_eq!(PageSeparator::Comment.render(3), "\n\n<!-- page 3 -->\n\n");
        assert_eq!(PageSeparator::None.render(1), "\n\n");
    }
}
