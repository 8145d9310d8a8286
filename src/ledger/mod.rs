//! Ledger access: the anchoring call and its retry policy.

pub mod http;
pub mod simulated;

use crate::config::LedgerConfig;
use crate::submission::LedgerReceipt;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use http::HttpLedger;
pub use simulated::{is_simulated_tx, SimulatedLedger, SIMULATED_TX_PREFIX};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("ledger rejected anchor: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Transport(err.to_string())
    }
}

/// A ledger that can durably record `(exam_id, hash)`.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn anchor(&self, exam_id: &str, hash: &str) -> Result<LedgerReceipt, LedgerError>;

    /// Short label for logs
    fn describe(&self) -> String;

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.min(16))
    }
}

/// Runs anchoring calls against a [`Ledger`] under a [`RetryPolicy`].
#[derive(Clone)]
pub struct LedgerSubmitter {
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
}

impl LedgerSubmitter {
    pub fn new(ledger: Arc<dyn Ledger>, policy: RetryPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Anchor a hash. Returns `None` once every attempt has failed.
    pub async fn anchor(&self, exam_id: &str, hash: &str) -> Option<LedgerReceipt> {
        let max_attempts = self.policy.max_attempts.max(1);
        let short_hash = hash.get(..16).unwrap_or(hash);

        for attempt in 1..=max_attempts {
            debug!(
                "Anchoring {} for exam {} (try {}/{})",
                short_hash, exam_id, attempt, max_attempts
            );

            match self.ledger.anchor(exam_id, hash).await {
                Ok(receipt) => {
                    info!(
                        tx_id = %receipt.tx_id,
                        sequence = receipt.sequence,
                        "Anchored {} on attempt {}",
                        short_hash,
                        attempt
                    );
                    return Some(receipt);
                }
                Err(e) => {
                    warn!(attempt, "Anchor attempt for {} failed: {}", short_hash, e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        error!(
            "Anchoring {} failed after {} attempts",
            short_hash, max_attempts
        );
        None
    }
}

/// Pick the live HTTP ledger when fully configured, the simulator otherwise.
pub fn ledger_from_config(config: &LedgerConfig) -> Result<Arc<dyn Ledger>, LedgerError> {
    match config.live_settings() {
        Some((endpoint, api_key, contract)) => Ok(Arc::new(HttpLedger::new(
            endpoint,
            api_key,
            contract,
            config.request_timeout,
        )?)),
        None => {
            warn!("Ledger endpoint, key or contract address not configured; simulating anchors");
            Ok(Arc::new(SimulatedLedger::new(config.simulate_delay)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyLedger {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Ledger for FlakyLedger {
        async fn anchor(&self, _exam_id: &str, hash: &str) -> Result<LedgerReceipt, LedgerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(LedgerError::Unavailable(format!("call {}", call)));
            }
            Ok(LedgerReceipt {
                tx_id: format!("0x{}", hash),
                sequence: call as u64,
                confirmed_at: Utc::now(),
            })
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn submitter(failures: u32, policy: RetryPolicy) -> (Arc<FlakyLedger>, LedgerSubmitter) {
        let ledger = Arc::new(FlakyLedger {
            failures,
            calls: AtomicU32::new(0),
        });
        let submitter = LedgerSubmitter::new(ledger.clone(), policy);
        (ledger, submitter)
    }

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (ledger, submitter) = submitter(2, no_delay(3));
        let receipt = submitter.anchor("exam", "abcd").await;
        assert!(receipt.is_some());
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_bounded() {
        let (ledger, submitter) = submitter(u32::MAX, no_delay(3));
        assert!(submitter.anchor("exam", "abcd").await.is_none());
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let (ledger, submitter) = submitter(0, no_delay(0));
        assert!(submitter.anchor("exam", "abcd").await.is_some());
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_exponential() {
        let (_ledger, submitter) = submitter(u32::MAX, RetryPolicy::default());
        let started = tokio::time::Instant::now();
        assert!(submitter.anchor("exam", "abcd").await.is_none());
        // 2s after the first failure, 4s after the second, none after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_unconfigured_ledger_is_simulated() {
        let ledger = ledger_from_config(&LedgerConfig::default()).unwrap();
        assert!(ledger.is_simulated());
    }

    #[test]
    fn test_configured_ledger_is_live() {
        let config = LedgerConfig {
            endpoint: Some("http://127.0.0.1:9".to_string()),
            api_key: Some("key".to_string()),
            contract_address: Some("0x1234".to_string()),
            ..Default::default()
        };
        let ledger = ledger_from_config(&config).unwrap();
        assert!(!ledger.is_simulated());
    }
}
