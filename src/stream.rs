//! Streaming extraction API: emit pages as they complete, in page order.
//!
//! Large documents take a while. [`extract_stream`] yields one
//! [`PageOutcome`] per selected page as soon as it and every earlier page
//! are done, so callers can start building prompts before the last page is
//! fused and never hold more than the reorder window in memory.
//!
//! Unlike the eager [`crate::extract::Pipeline::extract`], no document-level
//! scores are computed here. Running headers and footers are recognised
//! incrementally: a margin line is promoted once it has been seen on an
//! earlier page, so its first occurrence stays a plain paragraph.

use crate::error::ExtractError;
use crate::extract::{drive, DriveEnd, PageSink, Pipeline};
use crate::output::{ExtractionResult, PageOutcome, QualityIssue};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::classify::FurnitureIndex;
use crate::pipeline::page::PageRun;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info};

/// A boxed stream of page outcomes.
///
/// The stream ends after the last selected page. When the run is cancelled
/// it ends with one `Err(ExtractError::Cancelled { .. })` whose partial
/// result carries the metadata and the `Cancelled` issue; its pages were
/// already yielded.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<PageOutcome, ExtractError>> + Send>>;

type PageSender = mpsc::Sender<Result<PageOutcome, ExtractError>>;

/// Forwards pages to the stream's channel, promoting running
/// headers/footers as they repeat.
struct Forward {
    tx: PageSender,
    furniture: FurnitureIndex,
    delivered: usize,
}

#[async_trait]
impl PageSink for Forward {
    async fn deliver(&mut self, run: PageRun) -> Result<(), ExtractError> {
        let mut outcome = run.outcome;
        self.furniture.observe(outcome.page, &outcome.furniture_candidates);
        self.furniture.apply(&mut outcome);
        self.tx
            .send(Ok(outcome))
            .await
            .map_err(|_| ExtractError::Internal("page stream receiver dropped".into()))?;
        self.delivered += 1;
        Ok(())
    }
}

/// Extract a PDF, streaming page outcomes in page order.
///
/// # Returns
/// - `Ok(PageStream)`: ordered page outcomes
/// - `Err(ExtractError)`: fatal error before any page ran (malformed
///   document, empty selection, invalid configuration)
pub async fn extract_stream(
    pipeline: &Pipeline,
    bytes: &[u8],
    token: CancellationToken,
) -> Result<PageStream, ExtractError> {
    let prepared = pipeline.prepare(bytes).await?;
    let concurrency = pipeline.config().page_concurrency;
    let progress = pipeline.config().progress_callback.clone();
    info!(
        "Starting streaming extraction: {} of {} pages",
        prepared.selected.len(),
        prepared.metadata.page_count
    );

    let (tx, rx) = mpsc::channel(concurrency);

    tokio::spawn(async move {
        let total = prepared.selected.len();
        let mut sink = Forward {
            tx,
            furniture: FurnitureIndex::new(),
            delivered: 0,
        };

        let end = drive(&prepared, concurrency, progress.as_ref(), &token, &mut sink).await;

        if let Some(ref cb) = progress {
            cb.on_extraction_complete(total, sink.delivered);
        }

        match end {
            Ok(DriveEnd::Finished) => debug!("Page stream finished: {} pages", sink.delivered),
            Ok(DriveEnd::Cancelled) => {
                let mut partial = ExtractionResult {
                    metadata: prepared.metadata.clone(),
                    cancelled: true,
                    ..Default::default()
                };
                partial.metadata.pages_processed = sink.delivered;
                partial.quality.issues.push(QualityIssue::Cancelled {
                    pages_completed: sink.delivered,
                });
                let _ = sink
                    .tx
                    .send(Err(ExtractError::Cancelled {
                        partial: Box::new(partial),
                    }))
                    .await;
            }
            Err(e) => {
                debug!("Page stream stopped: {}", e);
                let _ = sink.tx.send(Err(e)).await;
            }
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}
