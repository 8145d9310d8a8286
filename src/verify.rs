//! Submission verification.
//!
//! Recomputes a stored submission's hash and compares it with the hash that
//! was anchored. A mismatch means the stored answers changed after anchoring.

use crate::canonical::submission_hash;
use crate::ledger::is_simulated_tx;
use crate::store::{StoreError, SubmissionStore};
use crate::submission::{AnchorStatus, Submission};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub submission_id: String,
    pub anchor_status: AnchorStatus,
    pub stored_hash: Option<String>,
    pub computed_hash: String,
    pub ledger_tx_id: Option<String>,
    pub ledger_sequence: Option<u64>,
    pub ledger_confirmed_at: Option<DateTime<Utc>>,
}

impl VerificationReport {
    pub fn from_submission(submission: &Submission) -> Self {
        Self {
            submission_id: submission.id.clone(),
            anchor_status: submission.anchor_status,
            stored_hash: submission.submission_hash.clone(),
            computed_hash: submission_hash(submission),
            ledger_tx_id: submission.ledger_tx_id.clone(),
            ledger_sequence: submission.ledger_sequence,
            ledger_confirmed_at: submission.ledger_confirmed_at,
        }
    }

    /// `None` when nothing has been hashed yet.
    pub fn hash_matches(&self) -> Option<bool> {
        self.stored_hash
            .as_deref()
            .map(|stored| stored == self.computed_hash)
    }

    /// Confirmed on the ledger and the content still hashes to the anchor.
    pub fn is_intact(&self) -> bool {
        self.anchor_status == AnchorStatus::Confirmed && self.hash_matches() == Some(true)
    }

    /// Anchored by the simulator rather than a real ledger.
    pub fn is_simulated(&self) -> bool {
        self.ledger_tx_id.as_deref().is_some_and(is_simulated_tx)
    }
}

/// Load a submission and verify it. `Ok(None)` if it does not exist.
pub async fn verify_submission(
    store: &dyn SubmissionStore,
    id: &str,
) -> Result<Option<VerificationReport>, StoreError> {
    Ok(store
        .get(id)
        .await?
        .map(|s| VerificationReport::from_submission(&s)))
}
