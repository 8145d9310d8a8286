//! Batch Drainer
//!
//! Anchors every submission awaiting anchoring, one page at a time:
//! 1. Fetch up to `batch_size` pending submissions, topped up with submissions
//!    that have no status yet
//! 2. Process the page concurrently; outcomes are independent
//! 3. A full page means more may be waiting, so fetch again
//!
//! Only one drain runs at a time. Requests from the change feed arrive through a
//! single-slot channel, so a burst of notifications collapses into one extra
//! drain.

use super::processor::{ProcessOutcome, SubmissionProcessor};
use super::WorkerContext;
use crate::store::StoreError;
use crate::submission::{AnchorStatus, Submission};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Sending half of the drain request channel.
#[derive(Clone, Debug)]
pub struct DrainTrigger {
    tx: mpsc::Sender<()>,
}

impl DrainTrigger {
    /// Ask for a drain. Returns false when a request is already queued (the
    /// queued one will cover this change) or the drainer is gone.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Receiving half of the drain request channel.
pub struct DrainRequests {
    rx: mpsc::Receiver<()>,
}

impl DrainRequests {
    /// Wait for the next request; `false` once every trigger is dropped.
    pub async fn recv(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Single-slot request channel between the listener and the drainer.
pub fn drain_channel() -> (DrainTrigger, DrainRequests) {
    let (tx, rx) = mpsc::channel(1);
    (DrainTrigger { tx }, DrainRequests { rx })
}

/// Totals for one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Non-empty pages fetched
    pub pages: usize,
    pub processed: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Confirmed(_) => self.confirmed += 1,
            ProcessOutcome::Failed => self.failed += 1,
            ProcessOutcome::Skipped => self.skipped += 1,
            ProcessOutcome::Errored => self.errored += 1,
        }
    }
}

/// Clears the running flag when dropped.
struct DrainGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct PageResult {
    fetched: usize,
    terminal: usize,
}

pub struct BatchDrainer {
    ctx: Arc<WorkerContext>,
    processor: SubmissionProcessor,
    running: AtomicBool,
}

impl BatchDrainer {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let processor = SubmissionProcessor::from_context(&ctx);
        Self {
            ctx,
            processor,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> Option<DrainGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DrainGuard {
                running: &self.running,
            })
    }

    /// Drain until no eligible submissions remain.
    ///
    /// Returns `None` without doing anything when another drain holds the
    /// guard.
    pub async fn drain(&self) -> Option<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            let page = {
                let Some(_guard) = self.try_acquire() else {
                    if report.pages == 0 {
                        debug!("Drain already running, request ignored");
                        return None;
                    }
                    // Another drain picked up the continuation
                    break;
                };
                self.drain_page(&mut report).await
            };

            match page {
                Ok(page) if page.fetched < self.ctx.batch_size => break,
                Ok(page) if page.terminal == 0 => {
                    warn!(
                        "Full page of {} submissions made no progress, stopping drain",
                        page.fetched
                    );
                    break;
                }
                Ok(_) => debug!("Page was full, continuing drain"),
                Err(e) => {
                    error!("Error processing batch: {}", e);
                    break;
                }
            }
        }

        if report.processed > 0 {
            info!(
                "Drain complete: {} pages, {} confirmed, {} failed, {} skipped, {} errored",
                report.pages, report.confirmed, report.failed, report.skipped, report.errored
            );
        }
        Some(report)
    }

    /// Pending submissions first, then never-attempted ones.
    async fn fetch_page(&self) -> Result<Vec<Submission>, StoreError> {
        let limit = self.ctx.batch_size;
        let mut page = self
            .ctx
            .store
            .find_by_status(AnchorStatus::Pending, limit)
            .await?;

        if page.len() < limit {
            let unset = self
                .ctx
                .store
                .find_by_status(AnchorStatus::Unset, limit - page.len())
                .await?;
            page.extend(unset);
        }
        Ok(page)
    }

    async fn drain_page(&self, report: &mut DrainReport) -> Result<PageResult, StoreError> {
        let page = self.fetch_page().await?;
        if page.is_empty() {
            debug!("No submissions awaiting anchoring");
            return Ok(PageResult {
                fetched: 0,
                terminal: 0,
            });
        }

        let fetched = page.len();
        report.pages += 1;
        info!("Found {} submissions to anchor in batch", fetched);

        let outcomes: Vec<ProcessOutcome> = futures::stream::iter(page)
            .map(|submission| {
                let processor = self.processor.clone();
                async move { processor.process(&submission).await }
            })
            .buffer_unordered(self.ctx.concurrency.max(1))
            .collect()
            .await;

        let mut terminal = 0;
        for outcome in &outcomes {
            report.record(outcome);
            if outcome.is_terminal() {
                terminal += 1;
            }
        }

        Ok(PageResult { fetched, terminal })
    }

    /// Serve drain requests until every trigger is dropped.
    pub async fn run(self: Arc<Self>, mut requests: DrainRequests) {
        while requests.recv().await {
            self.drain().await;
        }
        debug!("Drain request channel closed");
    }
}
