//! Simulated ledger for runs without ledger infrastructure.
//!
//! Every anchor succeeds after a fixed delay. Transaction ids carry
//! [`SIMULATED_TX_PREFIX`] so they can never be mistaken for real ones.

use super::{Ledger, LedgerError};
use crate::submission::LedgerReceipt;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

pub const SIMULATED_TX_PREFIX: &str = "sim-";

/// Whether a transaction id was produced by [`SimulatedLedger`].
pub fn is_simulated_tx(tx_id: &str) -> bool {
    tx_id.starts_with(SIMULATED_TX_PREFIX)
}

pub struct SimulatedLedger {
    delay: Duration,
    sequence: AtomicU64,
}

impl SimulatedLedger {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            sequence: AtomicU64::new(0),
        }
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    async fn anchor(&self, exam_id: &str, hash: &str) -> Result<LedgerReceipt, LedgerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let now = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_id = format!(
            "{}0x{}_{}",
            SIMULATED_TX_PREFIX,
            hash.get(..10).unwrap_or(hash),
            now.timestamp_millis()
        );
        debug!("Simulated anchor for exam {}: {}", exam_id, tx_id);

        Ok(LedgerReceipt {
            tx_id,
            sequence,
            confirmed_at: now,
        })
    }

    fn describe(&self) -> String {
        format!("simulated (delay {}ms)", self.delay.as_millis())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}
