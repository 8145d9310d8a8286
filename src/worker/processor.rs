//! Submission Processor
//!
//! Takes one submission through canonicalize -> hash -> anchor -> persist.
//!
//! State transitions:
//! - `confirmed`/`failed`, or a hash on a non-pending record: skipped, no writes
//! - unset: hash, mark `pending` with the hash, anchor, write terminal state
//! - pending: reuse the stored hash when present, anchor, write terminal state
//! - any error on the way: best-effort `failed` write

use super::WorkerContext;
use crate::canonical::submission_hash;
use crate::ledger::LedgerSubmitter;
use crate::store::{StoreError, SubmissionStore};
use crate::submission::{AnchorStatus, LedgerReceipt, Submission, SubmissionPatch};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("submission not found: {0}")]
    NotFound(String),
}

/// What happened to one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Already anchored or hashed; nothing written
    Skipped,
    Confirmed(LedgerReceipt),
    /// Ledger retries exhausted
    Failed,
    /// Store error; a `failed` fallback write was attempted
    Errored,
}

impl ProcessOutcome {
    /// Whether the submission left the eligible set.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessOutcome::Confirmed(_) | ProcessOutcome::Failed)
    }
}

/// Why a submission must not be sent to the ledger again.
fn skip_reason(submission: &Submission) -> Option<&'static str> {
    match submission.anchor_status {
        AnchorStatus::Confirmed => Some("already confirmed"),
        AnchorStatus::Failed => Some("failed; needs operator reset"),
        AnchorStatus::Unset if submission.submission_hash.is_some() => Some("already hashed"),
        _ => None,
    }
}

#[derive(Clone)]
pub struct SubmissionProcessor {
    store: Arc<dyn SubmissionStore>,
    submitter: LedgerSubmitter,
}

impl SubmissionProcessor {
    pub fn new(store: Arc<dyn SubmissionStore>, submitter: LedgerSubmitter) -> Self {
        Self { store, submitter }
    }

    pub fn from_context(ctx: &WorkerContext) -> Self {
        Self::new(ctx.store.clone(), ctx.submitter.clone())
    }

    /// Load a submission by id and process it.
    pub async fn process_by_id(&self, id: &str) -> Result<ProcessOutcome, ProcessError> {
        let submission = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        Ok(self.process(&submission).await)
    }

    /// Process a submission snapshot. Never fails; errors are recorded as a
    /// `failed` status where possible.
    pub async fn process(&self, submission: &Submission) -> ProcessOutcome {
        if let Some(reason) = skip_reason(submission) {
            debug!("Skipping submission {}: {}", submission.id, reason);
            return ProcessOutcome::Skipped;
        }

        info!("Processing submission {}", submission.id);

        let mut hash = None;
        match self.anchor_submission(submission, &mut hash).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Error processing submission {}: {}", submission.id, e);
                let fallback = SubmissionPatch::failed(hash.as_deref());
                if let Err(e) = self.store.update(&submission.id, &fallback).await {
                    error!(
                        "Fallback failed-status write for {} also failed: {}",
                        submission.id, e
                    );
                }
                ProcessOutcome::Errored
            }
        }
    }

    async fn anchor_submission(
        &self,
        submission: &Submission,
        hash_slot: &mut Option<String>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let id = submission.id.as_str();

        // A pending record from an interrupted attempt keeps its stored hash
        let hash = match (&submission.submission_hash, submission.anchor_status) {
            (Some(stored), AnchorStatus::Pending) => stored.clone(),
            _ => submission_hash(submission),
        };
        *hash_slot = Some(hash.clone());
        info!(submission_id = id, "Submission hashed: {}", hash);

        if submission.anchor_status != AnchorStatus::Pending {
            self.store
                .update(id, &SubmissionPatch::pending(&hash))
                .await?;
        }

        let exam_id = submission.exam_id.as_deref().unwrap_or_default();
        match self.submitter.anchor(exam_id, &hash).await {
            Some(receipt) => {
                self.store
                    .update(id, &SubmissionPatch::confirmed(&hash, receipt.clone()))
                    .await?;
                info!(
                    submission_id = id,
                    tx_id = %receipt.tx_id,
                    "Submission anchored"
                );
                Ok(ProcessOutcome::Confirmed(receipt))
            }
            None => {
                self.store
                    .update(id, &SubmissionPatch::failed(Some(&hash)))
                    .await?;
                warn!(submission_id = id, "Submission marked failed");
                Ok(ProcessOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Ledger, LedgerError, RetryPolicy};
    use crate::store::MemoryStore;
    use crate::submission::{Answer, AnswerSet};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records calls; fails every call when `fail` is set.
    #[derive(Default)]
    struct RecordingLedger {
        fail: bool,
        calls: Mutex<Vec<(String, String)>>,
        counter: AtomicUsize,
    }

    #[async_trait]
    impl Ledger for RecordingLedger {
        async fn anchor(&self, exam_id: &str, hash: &str) -> Result<LedgerReceipt, LedgerError> {
            self.calls
                .lock()
                .push((exam_id.to_string(), hash.to_string()));
            let n = self.counter.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            if self.fail {
                return Err(LedgerError::Transport("connection refused".to_string()));
            }
            Ok(LedgerReceipt {
                tx_id: format!("0xtx{}", n),
                sequence: 100 + n,
                confirmed_at: Utc::now(),
            })
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    fn setup(fail: bool) -> (Arc<MemoryStore>, Arc<RecordingLedger>, SubmissionProcessor) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(RecordingLedger {
            fail,
            ..Default::default()
        });
        let submitter = LedgerSubmitter::new(
            ledger.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
            },
        );
        let processor = SubmissionProcessor::new(store.clone(), submitter);
        (store, ledger, processor)
    }

    fn sample(id: &str) -> Submission {
        Submission::new(id, "exam-9").with_answers(AnswerSet::List(vec![
            Answer::new("q2", "B"),
            Answer::new("q1", "A"),
        ]))
    }

    #[tokio::test]
    async fn test_unset_submission_is_confirmed() {
        let (store, ledger, processor) = setup(false);
        let sub = sample("sub-1");
        store.insert(&sub).await.unwrap();

        let outcome = processor.process(&sub).await;
        assert!(matches!(outcome, ProcessOutcome::Confirmed(_)));

        let stored = store.get("sub-1").await.unwrap().unwrap();
        assert_eq!(stored.anchor_status, AnchorStatus::Confirmed);
        assert_eq!(stored.submission_hash, Some(submission_hash(&sub)));
        assert_eq!(stored.ledger_tx_id.as_deref(), Some("0xtx1"));
        assert_eq!(stored.ledger_sequence, Some(101));
        assert!(stored.ledger_confirmed_at.is_some());

        // pending marker + terminal write
        assert_eq!(store.update_count(), 2);
        let calls = ledger.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "exam-9");
    }

    #[tokio::test]
    async fn test_pending_submission_skips_marker_write() {
        let (store, _ledger, processor) = setup(false);
        let sub = sample("sub-2").with_status(AnchorStatus::Pending);
        store.insert(&sub).await.unwrap();

        processor.process(&sub).await;
        assert_eq!(store.update_count(), 1);
        let stored = store.get("sub-2").await.unwrap().unwrap();
        assert_eq!(stored.anchor_status, AnchorStatus::Confirmed);
        assert!(stored.submission_hash.is_some());
    }

    #[tokio::test]
    async fn test_confirmed_submission_is_idempotent() {
        let (store, ledger, processor) = setup(false);
        store.insert(&sample("sub-3")).await.unwrap();

        processor.process_by_id("sub-3").await.unwrap();
        let writes = store.update_count();
        let calls = ledger.calls.lock().len();

        let second = processor.process_by_id("sub-3").await.unwrap();
        assert_eq!(second, ProcessOutcome::Skipped);
        assert_eq!(store.update_count(), writes);
        assert_eq!(ledger.calls.lock().len(), calls);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed_with_hash() {
        let (store, ledger, processor) = setup(true);
        let sub = sample("sub-4");
        store.insert(&sub).await.unwrap();

        assert_eq!(processor.process(&sub).await, ProcessOutcome::Failed);
        assert_eq!(ledger.calls.lock().len(), 3);

        let stored = store.get("sub-4").await.unwrap().unwrap();
        assert_eq!(stored.anchor_status, AnchorStatus::Failed);
        assert_eq!(stored.submission_hash, Some(submission_hash(&sub)));
        assert!(stored.ledger_tx_id.is_none());
    }

    #[tokio::test]
    async fn test_failed_submission_is_not_retried() {
        let (store, ledger, processor) = setup(false);
        let sub = sample("sub-5").with_status(AnchorStatus::Failed);
        store.insert(&sub).await.unwrap();

        assert_eq!(processor.process(&sub).await, ProcessOutcome::Skipped);
        assert!(ledger.calls.lock().is_empty());
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_resumed_pending_keeps_stored_hash() {
        let (store, ledger, processor) = setup(false);
        let mut sub = sample("sub-6").with_status(AnchorStatus::Pending);
        sub.submission_hash = Some("stored-hash".to_string());
        store.insert(&sub).await.unwrap();

        processor.process(&sub).await;

        assert_eq!(ledger.calls.lock()[0].1, "stored-hash");
        let stored = store.get("sub-6").await.unwrap().unwrap();
        assert_eq!(stored.submission_hash.as_deref(), Some("stored-hash"));
        assert_eq!(stored.anchor_status, AnchorStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_hashed_unset_submission_is_skipped() {
        let (store, ledger, processor) = setup(false);
        let mut sub = sample("sub-7");
        sub.submission_hash = Some("h".to_string());
        store.insert(&sub).await.unwrap();

        assert_eq!(processor.process(&sub).await, ProcessOutcome::Skipped);
        assert!(ledger.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_record_errors_and_swallows_fallback() {
        let (store, ledger, processor) = setup(false);
        // Never inserted: the pending write fails with NotFound
        let sub = sample("ghost");

        assert_eq!(processor.process(&sub).await, ProcessOutcome::Errored);
        assert!(ledger.calls.lock().is_empty());
        // pending attempt + fallback attempt
        assert_eq!(store.update_count(), 2);

        let err = processor.process_by_id("ghost").await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound(_)));
    }
}
