//! Canonical serialization and integrity hashing.
//!
//! The canonical form is a compact JSON object with a fixed key order:
//! `submissionId`, `studentId`, `examId`, `submittedAt`, `answers`. Answers are
//! sorted by question id and carry only `questionId` and `value`. Nested objects
//! inside answer values are emitted with sorted keys.

use crate::submission::{Answer, Submission};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalSubmission<'a> {
    submission_id: &'a str,
    student_id: &'a str,
    exam_id: &'a str,
    submitted_at: &'a str,
    answers: Vec<Answer>,
}

/// Deterministic byte form of a submission.
pub fn canonicalize(submission: &Submission) -> Vec<u8> {
    let canonical = CanonicalSubmission {
        submission_id: &submission.id,
        student_id: submission.student_id.as_deref().unwrap_or_default(),
        exam_id: submission.exam_id.as_deref().unwrap_or_default(),
        submitted_at: submission.submitted_at.as_deref().unwrap_or_default(),
        answers: submission
            .answers
            .normalize()
            .into_iter()
            .map(|a| Answer::new(a.question_id, sorted_keys(&a.value)))
            .collect(),
    };

    // Only strings and serde_json::Value are serialized; this cannot fail.
    serde_json::to_vec(&canonical).unwrap_or_default()
}

/// Rebuild objects with keys inserted in sorted order, independent of whether
/// serde_json keeps insertion order.
fn sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), sorted_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_keys).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of the canonical bytes, lowercase hex.
pub fn hash_canonical(canonical: &[u8]) -> String {
    hex::encode(Sha256::digest(canonical))
}

/// Canonicalize and hash in one step.
pub fn submission_hash(submission: &Submission) -> String {
    hash_canonical(&canonicalize(submission))
}
