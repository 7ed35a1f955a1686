//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline processes each page.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf_extract::{ExtractionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, items: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} items)", page_num, total_pages, items);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each page.
///
/// Pages run concurrently, so `on_page_start` may be called from several
/// tasks at once and out of page order. `on_page_issue` and
/// `on_page_complete` are reported as pages leave the reorder buffer, so
/// they arrive in page order. Implementations must protect shared mutable
/// state (e.g. `Mutex`, `AtomicUsize`). All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once, after splitting, with the number of selected pages.
    fn on_extraction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called before a page's extractors are started.
    ///
    /// * `page_num`: 1-indexed page number
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page has been fused.
    ///
    /// * `items`: number of fused items the page produced
    fn on_page_complete(&self, page_num: usize, total_pages: usize, items: usize) {
        let _ = (page_num, total_pages, items);
    }

    /// Called for each page-scoped problem (extractor failure, OCR failure).
    fn on_page_issue(&self, page_num: usize, total_pages: usize, issue: &str) {
        let _ = (page_num, total_pages, issue);
    }

    /// Called once when the run ends, whether finished or cancelled.
    fn on_extraction_complete(&self, total_pages: usize, completed_pages: usize) {
        let _ = (total_pages, completed_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        issues: AtomicUsize,
        completed_total: AtomicUsize,
    }

    impl ExtractionProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _items: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_issue(&self, _page_num: usize, _total_pages: usize, _issue: &str) {
            self.issues.fetch_add(1, Ordering::SeqCst);
        }

        fn on_extraction_complete(&self, _total_pages: usize, completed_pages: usize) {
            self.completed_total.store(completed_pages, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_extraction_start(5);
        cb.on_page_start(1, 5);
        cb.on_page_complete(1, 5, 12);
        cb.on_page_issue(2, 5, "timeout");
        cb.on_extraction_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_start(1, 2);
        tracker.on_page_complete(1, 2, 3);
        tracker.on_page_start(2, 2);
        tracker.on_page_issue(2, 2, "extractor failed");
        tracker.on_page_complete(2, 2, 0);
        tracker.on_extraction_complete(2, 2);

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.issues.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completed_total.load(Ordering::SeqCst), 2);
    }
}
