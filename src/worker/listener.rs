//! Change Feed Listener
//!
//! Watches the submissions collection and asks for a drain whenever a
//! submission is added or modified with no status or `pending`. A broken
//! subscription is retried after a fixed delay, forever.

use super::drainer::DrainTrigger;
use crate::store::{ChangeFeed, SubmissionStore};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ChangeFeedListener {
    store: Arc<dyn SubmissionStore>,
    trigger: DrainTrigger,
    resubscribe_delay: Duration,
}

impl ChangeFeedListener {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        trigger: DrainTrigger,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            store,
            trigger,
            resubscribe_delay,
        }
    }

    /// Listen forever.
    pub async fn run(self) {
        loop {
            match self.store.subscribe() {
                Ok(feed) => {
                    info!("Listening for submission changes");
                    // Catch anything written while we were not subscribed
                    self.trigger.request();
                    let reason = self.consume(feed).await;
                    warn!("Change feed ended: {}", reason);
                }
                Err(e) => {
                    error!("Change feed subscription failed: {}", e);
                }
            }

            info!(
                "Resubscribing to change feed in {}s",
                self.resubscribe_delay.as_secs_f32()
            );
            tokio::time::sleep(self.resubscribe_delay).await;
        }
    }

    /// Forward eligible changes until the feed breaks; returns why it ended.
    async fn consume(&self, mut feed: ChangeFeed) -> String {
        while let Some(item) = feed.next().await {
            match item {
                Ok(event) if event.makes_eligible() => {
                    debug!(
                        "Submission {} is {:?}/{}, requesting drain",
                        event.submission_id, event.kind, event.anchor_status
                    );
                    self.trigger.request();
                }
                Ok(_) => {}
                Err(e) => return e.to_string(),
            }
        }
        "stream closed".to_string()
    }
}
