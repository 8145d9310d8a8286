//! Background anchoring worker.
//!
//! Flow:
//! 1. Request one drain at startup to recover backlog
//! 2. The change feed listener requests a drain for every eligible change
//! 3. The drainer serves requests one at a time, processing pages of
//!    submissions concurrently

pub mod drainer;
pub mod listener;
pub mod processor;

use crate::config::AnchorConfig;
use crate::ledger::{Ledger, LedgerSubmitter};
use crate::store::SubmissionStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub use drainer::{drain_channel, BatchDrainer, DrainReport, DrainRequests, DrainTrigger};
pub use listener::ChangeFeedListener;
pub use processor::{ProcessError, ProcessOutcome, SubmissionProcessor};

/// Everything the pipeline components share, built once at startup.
pub struct WorkerContext {
    pub store: Arc<dyn SubmissionStore>,
    pub submitter: LedgerSubmitter,
    pub batch_size: usize,
    pub concurrency: usize,
    pub resubscribe_delay: Duration,
}

impl WorkerContext {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        ledger: Arc<dyn Ledger>,
        config: &AnchorConfig,
    ) -> Self {
        Self {
            store,
            submitter: LedgerSubmitter::new(ledger, config.retry_policy()),
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            resubscribe_delay: config.resubscribe_delay,
        }
    }
}

/// The anchoring worker: drainer plus change feed listener.
pub struct AnchorWorker {
    ctx: Arc<WorkerContext>,
    drainer: Arc<BatchDrainer>,
}

impl AnchorWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        let ctx = Arc::new(ctx);
        let drainer = Arc::new(BatchDrainer::new(ctx.clone()));
        Self { ctx, drainer }
    }

    pub fn drainer(&self) -> &Arc<BatchDrainer> {
        &self.drainer
    }

    /// Run until `shutdown` resolves, or until the drainer or listener task
    /// exits on its own (logged as an error). In-flight anchoring is abandoned;
    /// unfinished submissions stay `pending` and are picked up by the next run.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "Anchor worker started (batch={}, concurrency={}, attempts={}, ledger={})",
            self.ctx.batch_size,
            self.ctx.concurrency,
            self.ctx.submitter.policy().max_attempts,
            self.ctx.submitter.ledger().describe()
        );

        let (trigger, requests) = drain_channel();
        trigger.request();

        let mut drain_task = tokio::spawn(self.drainer.clone().run(requests));
        let listener = ChangeFeedListener::new(
            self.ctx.store.clone(),
            trigger,
            self.ctx.resubscribe_delay,
        );
        let mut listen_task = tokio::spawn(listener.run());

        tokio::select! {
            _ = shutdown => info!("Shutting down anchor worker"),
            result = &mut drain_task => {
                error!("Batch drainer stopped unexpectedly: {}", task_exit(result));
            }
            result = &mut listen_task => {
                error!("Change feed listener stopped unexpectedly: {}", task_exit(result));
            }
        }

        listen_task.abort();
        drain_task.abort();
    }
}

fn task_exit(result: Result<(), tokio::task::JoinError>) -> String {
    match result {
        Ok(()) => "task returned".to_string(),
        Err(e) if e.is_panic() => "task panicked".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Start the worker in background; it stops when `shutdown` resolves.
pub fn spawn_anchor_worker<F>(ctx: WorkerContext, shutdown: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        AnchorWorker::new(ctx).run_until(shutdown).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SimulatedLedger;
    use crate::store::{ChangeFeed, MemoryStore, Result as StoreResult};
    use crate::submission::{AnchorStatus, Submission, SubmissionPatch};
    use async_trait::async_trait;

    /// MemoryStore whose change feed subscription panics.
    #[derive(Default)]
    struct PanickingFeedStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl SubmissionStore for PanickingFeedStore {
        async fn get(&self, id: &str) -> StoreResult<Option<Submission>> {
            self.inner.get(id).await
        }

        async fn find_by_status(
            &self,
            status: AnchorStatus,
            limit: usize,
        ) -> StoreResult<Vec<Submission>> {
            self.inner.find_by_status(status, limit).await
        }

        async fn update(&self, id: &str, patch: &SubmissionPatch) -> StoreResult<()> {
            self.inner.update(id, patch).await
        }

        async fn insert(&self, submission: &Submission) -> StoreResult<()> {
            self.inner.insert(submission).await
        }

        fn subscribe(&self) -> StoreResult<ChangeFeed> {
            panic!("feed backend crashed");
        }
    }

    #[test]
    fn test_context_from_config() {
        let config = AnchorConfig {
            batch_size: 0,
            concurrency: 4,
            ..Default::default()
        };
        let ctx = WorkerContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedLedger::new(Duration::ZERO)),
            &config,
        );
        assert_eq!(ctx.batch_size, 1);
        assert_eq!(ctx.concurrency, 4);
        assert_eq!(ctx.submitter.policy().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_worker_stops_when_a_task_dies() {
        let ctx = WorkerContext::new(
            Arc::new(PanickingFeedStore::default()),
            Arc::new(SimulatedLedger::new(Duration::ZERO)),
            &AnchorConfig::default(),
        );

        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            AnchorWorker::new(ctx).run_until(std::future::pending()),
        )
        .await;
        assert!(finished.is_ok(), "worker kept running after its listener died");
    }
}
