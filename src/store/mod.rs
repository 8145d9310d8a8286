//! Document store abstraction.
//!
//! The pipeline only needs four things from the store: read one submission,
//! query submissions by anchor status with a limit, patch fields by id, and a
//! change feed over the submissions collection.

pub mod memory;
pub mod sqlite;

use crate::submission::{AnchorStatus, Submission, SubmissionPatch};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("subscription error: {0}")]
    Subscription(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
}

/// One change notification on the submissions collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub submission_id: String,
    /// Status of the document after the change
    pub anchor_status: AnchorStatus,
}

impl ChangeEvent {
    /// A change that may have produced work for the drainer.
    pub fn makes_eligible(&self) -> bool {
        self.anchor_status.is_eligible()
    }
}

/// Live change notifications. An `Err` item or the end of the stream means the
/// subscription is gone and must be re-established.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent>>;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Submission>>;

    /// Submissions whose `anchorStatus` equals `status`. `Unset` matches
    /// records without the field that have not been hashed yet; a hashed record
    /// without a status is never anchored again, so it is not returned.
    async fn find_by_status(&self, status: AnchorStatus, limit: usize)
        -> Result<Vec<Submission>>;

    /// Patch fields of an existing submission.
    async fn update(&self, id: &str, patch: &SubmissionPatch) -> Result<()>;

    /// Add a new submission (seeding and tests; production records are written
    /// by the exam flow).
    async fn insert(&self, submission: &Submission) -> Result<()>;

    fn subscribe(&self) -> Result<ChangeFeed>;
}
