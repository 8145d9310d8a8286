//! Submission records as stored in the document store.
//!
//! The store is written by the exam-taking flow, so records arrive in whatever
//! shape the client produced. `answers` in particular may be a list of
//! `{questionId, value}` pairs or a plain `questionId -> value` map. Everything
//! downstream works on the normalized form returned by [`AnswerSet::normalize`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Anchoring state of a submission.
///
/// `Unset` covers records written without the field at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    #[default]
    Unset,
    Pending,
    Confirmed,
    Failed,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Unset => "unset",
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Failed => "failed",
        }
    }

    /// Terminal for an attempt: never re-entered automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnchorStatus::Confirmed | AnchorStatus::Failed)
    }

    /// Whether a record in this state should be picked up by a drain.
    pub fn is_eligible(&self) -> bool {
        matches!(self, AnchorStatus::Unset | AnchorStatus::Pending)
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unset" => Ok(AnchorStatus::Unset),
            "pending" => Ok(AnchorStatus::Pending),
            "confirmed" => Ok(AnchorStatus::Confirmed),
            "failed" => Ok(AnchorStatus::Failed),
            other => Err(format!("unknown anchor status: {}", other)),
        }
    }
}

/// A single answer. Missing fields default to empty values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(default)]
    pub question_id: String,
    #[serde(default)]
    pub value: Value,
}

impl Answer {
    pub fn new(question_id: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            question_id: question_id.into(),
            value: value.into(),
        }
    }
}

/// Answers in any of the shapes the client may have written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerSet {
    List(Vec<Answer>),
    Map(BTreeMap<String, Value>),
    /// Anything else (a string, a number, a list of non-objects...).
    Malformed(Value),
}

impl Default for AnswerSet {
    fn default() -> Self {
        AnswerSet::List(Vec::new())
    }
}

impl AnswerSet {
    /// Normalize into answers sorted by question id (byte-wise ordinal).
    ///
    /// Duplicate question ids keep the last occurrence in original order.
    /// Malformed input normalizes to an empty list.
    pub fn normalize(&self) -> Vec<Answer> {
        let by_question: BTreeMap<&str, &Value> = match self {
            AnswerSet::List(answers) => answers
                .iter()
                .map(|a| (a.question_id.as_str(), &a.value))
                .collect(),
            AnswerSet::Map(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            AnswerSet::Malformed(_) => BTreeMap::new(),
        };

        by_question
            .into_iter()
            .map(|(question_id, value)| Answer::new(question_id, value.clone()))
            .collect()
    }
}

/// Submission record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Store key
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub exam_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub answers: AnswerSet,
    /// Kept verbatim so the canonical form matches what the client stored
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub anchor_status: AnchorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_confirmed_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(id: impl Into<String>, exam_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exam_id: Some(exam_id.into()),
            ..Default::default()
        }
    }

    pub fn with_answers(mut self, answers: AnswerSet) -> Self {
        self.answers = answers;
        self
    }

    pub fn with_status(mut self, status: AnchorStatus) -> Self {
        self.anchor_status = status;
        self
    }

    /// Apply a field patch in place, the way the store does on update.
    pub fn apply(&mut self, patch: &SubmissionPatch) {
        if let Some(status) = patch.anchor_status {
            self.anchor_status = status;
        }
        if let Some(hash) = &patch.submission_hash {
            self.submission_hash = Some(hash.clone());
        }
        if let Some(receipt) = &patch.receipt {
            self.ledger_tx_id = Some(receipt.tx_id.clone());
            self.ledger_sequence = Some(receipt.sequence);
            self.ledger_confirmed_at = Some(receipt.confirmed_at);
        }
    }
}

/// Receipt returned by the ledger for a recorded hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub tx_id: String,
    pub sequence: u64,
    pub confirmed_at: DateTime<Utc>,
}

/// Fields the processor writes back. `None` leaves the stored field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionPatch {
    pub anchor_status: Option<AnchorStatus>,
    pub submission_hash: Option<String>,
    pub receipt: Option<LedgerReceipt>,
}

impl SubmissionPatch {
    pub fn pending(hash: &str) -> Self {
        Self {
            anchor_status: Some(AnchorStatus::Pending),
            submission_hash: Some(hash.to_string()),
            receipt: None,
        }
    }

    pub fn confirmed(hash: &str, receipt: LedgerReceipt) -> Self {
        Self {
            anchor_status: Some(AnchorStatus::Confirmed),
            submission_hash: Some(hash.to_string()),
            receipt: Some(receipt),
        }
    }

    pub fn failed(hash: Option<&str>) -> Self {
        Self {
            anchor_status: Some(AnchorStatus::Failed),
            submission_hash: hash.map(str::to_string),
            receipt: None,
        }
    }
}
