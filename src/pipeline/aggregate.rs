//! Result Aggregator: page outcomes in, one ordered result out.
//!
//! Pages finish in whatever order the scheduler's tasks complete. The
//! [`ReorderBuffer`] is the single place that restores page order: a slot
//! per in-flight page, filled by whichever task finishes, drained by one
//! consumer only when the next expected page is present. Its window equals
//! the page concurrency, so the scheduler never starts a page that would
//! not fit and the buffer never grows.

use crate::config::PipelineConfig;
use crate::error::{ExtractError, ReorderError};
use crate::output::{DocumentMetadata, ExtractionResult, FusedItem, PageOutcome, QualityIssue};
use crate::pipeline::classify::FurnitureIndex;
use crate::pipeline::quality::QualityAssessor;
use std::collections::VecDeque;
use tracing::debug;

/// Fixed-window buffer that releases values in index order.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    slots: VecDeque<Option<T>>,
}

impl<T> ReorderBuffer<T> {
    /// A buffer accepting indices `0..capacity` to begin with.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            next: 0,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The index the consumer is waiting for.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Whether `index` may be inserted now.
    pub fn accepts(&self, index: usize) -> bool {
        index >= self.next && index < self.next + self.capacity()
    }

    /// Values inserted but not yet released.
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Store the value for `index`.
    pub fn insert(&mut self, index: usize, value: T) -> Result<(), ReorderError> {
        if index < self.next {
            return Err(ReorderError::Duplicate { index });
        }
        if !self.accepts(index) {
            return Err(ReorderError::OutOfWindow {
                index,
                next: self.next,
                end: self.next + self.capacity(),
            });
        }
        let slot = &mut self.slots[index - self.next];
        if slot.is_some() {
            return Err(ReorderError::Duplicate { index });
        }
        *slot = Some(value);
        Ok(())
    }

    /// Release the longest run of consecutive values starting at
    /// [`next_index`](Self::next_index), advancing the window past them.
    pub fn pop_ready(&mut self) -> Vec<(usize, T)> {
        let mut ready = Vec::new();
        while let Some(Some(_)) = self.slots.front() {
            if let Some(Some(value)) = self.slots.pop_front() {
                ready.push((self.next, value));
            }
            self.slots.push_back(None);
            self.next += 1;
        }
        ready
    }
}

/// Accumulates page outcomes, in page order, into an [`ExtractionResult`].
pub struct ResultAggregator<'a> {
    config: &'a PipelineConfig,
    metadata: DocumentMetadata,
    selected: Vec<usize>,
    outcomes: Vec<PageOutcome>,
    furniture: FurnitureIndex,
    any_page_failed: bool,
}

impl<'a> ResultAggregator<'a> {
    /// `selected` lists the 0-indexed pages the run will deliver, ascending.
    pub fn new(config: &'a PipelineConfig, metadata: DocumentMetadata, selected: Vec<usize>) -> Self {
        Self {
            config,
            metadata,
            selected,
            outcomes: Vec::new(),
            furniture: FurnitureIndex::new(),
            any_page_failed: false,
        }
    }

    /// Pages accepted so far.
    pub fn completed(&self) -> usize {
        self.outcomes.len()
    }

    /// Append the next page. Outcomes must arrive in exactly the selected
    /// page order with no gaps.
    pub fn push(&mut self, outcome: PageOutcome, all_extractors_failed: bool) -> Result<(), ExtractError> {
        let expected = self.selected.get(self.outcomes.len()).copied();
        if expected != Some(outcome.page) {
            return Err(ExtractError::Internal(format!(
                "aggregator expected page {:?}, got page {}",
                expected.map(|p| p + 1),
                outcome.page + 1
            )));
        }
        self.furniture.observe(outcome.page, &outcome.furniture_candidates);
        self.any_page_failed |= all_extractors_failed;
        self.outcomes.push(outcome);
        Ok(())
    }

    /// The complete result.
    pub fn finish(self) -> ExtractionResult {
        self.build(false)
    }

    /// The result for the pages completed so far, flagged as cancelled.
    pub fn cancelled(self) -> ExtractionResult {
        self.build(true)
    }

    fn build(mut self, cancelled: bool) -> ExtractionResult {
        let mut promoted = 0;
        for outcome in &mut self.outcomes {
            promoted += self.furniture.apply(outcome);
        }

        let pages_processed = self.outcomes.len();
        let mut items: Vec<FusedItem> = Vec::new();
        let mut issues: Vec<QualityIssue> = Vec::new();
        let mut fallback_pages = Vec::new();
        for outcome in self.outcomes {
            if outcome.needs_fallback {
                fallback_pages.push(outcome.page);
            }
            items.extend(outcome.items);
            issues.extend(outcome.issues);
        }

        let quality = QualityAssessor::new(self.config).assess_document(
            &items,
            issues,
            fallback_pages,
            self.any_page_failed,
            cancelled.then_some(pages_processed),
        );

        debug!(
            "Aggregated {} pages into {} items ({} running headers/footers, cancelled: {})",
            pages_processed,
            items.len(),
            promoted,
            cancelled
        );

        let mut metadata = self.metadata;
        metadata.pages_selected = self.selected.len();
        metadata.pages_processed = pages_processed;
        ExtractionResult {
            metadata,
            items,
            quality,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{MarginBand, SemanticRole};
    use crate::geometry::BoundingBox;
    use crate::output::{FurnitureCandidate, FusedContent};

    #[test]
    fn releases_in_order_regardless_of_arrival() {
        let mut buf = ReorderBuffer::new(3);
        buf.insert(2, "c").unwrap();
        buf.insert(1, "b").unwrap();
        assert!(buf.pop_ready().is_empty());
        assert_eq!(buf.pending(), 2);
        buf.insert(0, "a").unwrap();
        assert_eq!(buf.pop_ready(), vec![(0, "a"), (1, "b"), (2, "c")]);
        assert_eq!(buf.next_index(), 3);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn window_slides_as_pages_drain() {
        let mut buf = ReorderBuffer::new(2);
        assert!(matches!(
            buf.insert(2, ()),
            Err(ReorderError::OutOfWindow { index: 2, next: 0, end: 2 })
        ));
        buf.insert(0, ()).unwrap();
        assert_eq!(buf.pop_ready().len(), 1);
        assert!(buf.accepts(2));
        buf.insert(2, ()).unwrap();
        assert!(buf.pop_ready().is_empty());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut buf = ReorderBuffer::new(2);
        buf.insert(1, 1).unwrap();
        assert_eq!(buf.insert(1, 2), Err(ReorderError::Duplicate { index: 1 }));
        buf.insert(0, 0).unwrap();
        buf.pop_ready();
        assert_eq!(buf.insert(0, 9), Err(ReorderError::Duplicate { index: 0 }));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buf: ReorderBuffer<()> = ReorderBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
    }

    fn outcome(page: usize, text: &str, footer: Option<&str>) -> PageOutcome {
        let mut items = vec![FusedItem {
            page,
            reading_order: 0,
            role: SemanticRole::Paragraph,
            bbox: BoundingBox::new(72.0, 100.0, 300.0, 112.0),
            confidence: 0.9,
            sources: vec![],
            content: FusedContent::Text { text: text.into() },
        }];
        let mut furniture_candidates = vec![];
        if let Some(f) = footer {
            items.push(FusedItem {
                reading_order: 1,
                bbox: BoundingBox::new(280.0, 760.0, 330.0, 770.0),
                content: FusedContent::Text { text: f.into() },
                ..items[0].clone()
            });
            furniture_candidates.push(FurnitureCandidate {
                reading_order: 1,
                band: MarginBand::Bottom,
                key: crate::pipeline::normalize::furniture_key(f),
            });
        }
        PageOutcome {
            page,
            items,
            furniture_candidates,
            ..Default::default()
        }
    }

    #[test]
    fn aggregator_requires_selected_order() {
        let cfg = PipelineConfig::default();
        let mut agg = ResultAggregator::new(&cfg, DocumentMetadata::default(), vec![0, 2]);
        assert!(agg.push(outcome(2, "late", None), false).is_err());
        agg.push(outcome(0, "first", None), false).unwrap();
        agg.push(outcome(2, "third", None), false).unwrap();
        let result = agg.finish();
        assert_eq!(result.metadata.pages_selected, 2);
        assert_eq!(result.metadata.pages_processed, 2);
        let pages: Vec<usize> = result.items.iter().map(|i| i.page).collect();
        assert_eq!(pages, vec![0, 2]);
        assert!(!result.cancelled);
    }

    #[test]
    fn repeated_footers_become_page_furniture() {
        let cfg = PipelineConfig::default();
        let mut agg = ResultAggregator::new(&cfg, DocumentMetadata::default(), vec![0, 1]);
        agg.push(outcome(0, "one", Some("Page 1")), false).unwrap();
        agg.push(outcome(1, "two", Some("Page 2")), false).unwrap();
        let result = agg.finish();
        let footers = result
            .items
            .iter()
            .filter(|i| i.role == SemanticRole::PageFooter)
            .count();
        assert_eq!(footers, 2);
    }

    #[test]
    fn cancelled_result_is_flagged_prefix() {
        let cfg = PipelineConfig::default();
        let mut agg = ResultAggregator::new(&cfg, DocumentMetadata::default(), vec![0, 1, 2]);
        agg.push(outcome(0, "one", None), false).unwrap();
        let result = agg.cancelled();
        assert!(result.cancelled);
        assert_eq!(result.metadata.pages_selected, 3);
        assert_eq!(result.metadata.pages_processed, 1);
        assert_eq!(
            result.quality.issues.last(),
            Some(&QualityIssue::Cancelled { pages_completed: 1 })
        );
    }
}
