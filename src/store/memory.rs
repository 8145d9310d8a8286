//! In-process document store.
//!
//! Used by tests and embedders that bring their own persistence. Change
//! notifications are fanned out over a broadcast channel; a subscriber that
//! falls behind gets a subscription error and is expected to resubscribe.

use super::{ChangeEvent, ChangeFeed, ChangeKind, Result, StoreError, SubmissionStore};
use crate::submission::{AnchorStatus, Submission, SubmissionPatch};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const FEED_CAPACITY: usize = 1024;

pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Submission>>,
    events: broadcast::Sender<ChangeEvent>,
    updates: AtomicUsize,
    queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            docs: RwLock::new(BTreeMap::new()),
            events,
            updates: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    /// Number of `update` calls that reached the store.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of `find_by_status` calls.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// All stored submissions, ordered by id.
    pub fn snapshot(&self) -> Vec<Submission> {
        self.docs.read().values().cloned().collect()
    }

    fn notify(&self, kind: ChangeKind, submission: &Submission) {
        // No receivers is fine
        let _ = self.events.send(ChangeEvent {
            kind,
            submission_id: submission.id.clone(),
            anchor_status: submission.anchor_status,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<Submission>> {
        Ok(self.docs.read().get(id).cloned())
    }

    async fn find_by_status(
        &self,
        status: AnchorStatus,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .docs
            .read()
            .values()
            .filter(|s| s.anchor_status == status)
            .filter(|s| status != AnchorStatus::Unset || s.submission_hash.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, id: &str, patch: &SubmissionPatch) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let updated = {
            let mut docs = self.docs.write();
            let doc = docs
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            doc.apply(patch);
            doc.clone()
        };
        self.notify(ChangeKind::Modified, &updated);
        Ok(())
    }

    async fn insert(&self, submission: &Submission) -> Result<()> {
        if submission.id.is_empty() {
            return Err(StoreError::InvalidData("submission id is empty".to_string()));
        }
        {
            let mut docs = self.docs.write();
            if docs.contains_key(&submission.id) {
                return Err(StoreError::InvalidData(format!(
                    "submission {} already exists",
                    submission.id
                )));
            }
            docs.insert(submission.id.clone(), submission.clone());
        }
        self.notify(ChangeKind::Added, submission);
        Ok(())
    }

    fn subscribe(&self) -> Result<ChangeFeed> {
        let feed = BroadcastStream::new(self.events.subscribe())
            .map(|item| item.map_err(|e| StoreError::Subscription(e.to_string())));
        Ok(feed.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_update() {
        let store = MemoryStore::new();
        store.insert(&Submission::new("a", "exam")).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.anchor_status, AnchorStatus::Unset);

        store
            .update("a", &SubmissionPatch::pending("h"))
            .await
            .unwrap();
        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.anchor_status, AnchorStatus::Pending);
        assert_eq!(store.update_count(), 1);

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update("nope", &SubmissionPatch::failed(None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        store.insert(&Submission::new("a", "e")).await.unwrap();
        assert!(store.insert(&Submission::new("a", "e")).await.is_err());
        assert!(store.insert(&Submission::new("", "e")).await.is_err());
    }

    #[tokio::test]
    async fn test_find_by_status_respects_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let sub = Submission::new(format!("s{}", i), "e").with_status(AnchorStatus::Pending);
            store.insert(&sub).await.unwrap();
        }
        store.insert(&Submission::new("u", "e")).await.unwrap();

        assert_eq!(
            store.find_by_status(AnchorStatus::Pending, 3).await.unwrap().len(),
            3
        );
        assert_eq!(
            store.find_by_status(AnchorStatus::Unset, 10).await.unwrap().len(),
            1
        );
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn test_hashed_unset_is_not_queried() {
        let store = MemoryStore::new();
        let mut hashed = Submission::new("a", "e");
        hashed.submission_hash = Some("h".to_string());
        store.insert(&hashed).await.unwrap();
        store.insert(&Submission::new("b", "e")).await.unwrap();

        let unset = store.find_by_status(AnchorStatus::Unset, 10).await.unwrap();
        assert_eq!(unset.len(), 1);
        assert_eq!(unset[0].id, "b");
    }

    #[tokio::test]
    async fn test_feed_reports_changes() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe().unwrap();

        store.insert(&Submission::new("a", "e")).await.unwrap();
        store
            .update("a", &SubmissionPatch::failed(Some("h")))
            .await
            .unwrap();

        let added = feed.next().await.unwrap().unwrap();
        assert_eq!(added.kind, ChangeKind::Added);
        assert!(added.makes_eligible());

        let modified = feed.next().await.unwrap().unwrap();
        assert_eq!(modified.kind, ChangeKind::Modified);
        assert_eq!(modified.anchor_status, AnchorStatus::Failed);
        assert!(!modified.makes_eligible());
    }
}
