//! HTTP anchoring gateway client.
//!
//! The gateway fronts the ledger contract: it signs and submits the
//! transaction, waits for one confirmation and answers with the receipt.
//!
//! ```text
//! POST {endpoint}/v1/anchors
//! Authorization: Bearer {api_key}
//! {"contract": "...", "examId": "...", "submissionHash": "..."}
//!
//! 200 {"txHash": "0x...", "blockNumber": 123, "confirmedAt": "2024-..."}
//! ```

use super::{Ledger, LedgerError};
use crate::submission::LedgerReceipt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnchorRequest<'a> {
    contract: &'a str,
    exam_id: &'a str,
    submission_hash: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnchorResponse {
    tx_hash: String,
    block_number: u64,
    #[serde(default)]
    confirmed_at: Option<DateTime<Utc>>,
}

pub struct HttpLedger {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    contract: String,
}

impl HttpLedger {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        contract: &str,
        timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            contract: contract.to_string(),
        })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn anchor(&self, exam_id: &str, hash: &str) -> Result<LedgerReceipt, LedgerError> {
        let url = format!("{}/v1/anchors", self.endpoint);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&AnchorRequest {
                contract: &self.contract,
                exam_id,
                submission_hash: hash,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnchorResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        if parsed.tx_hash.is_empty() {
            return Err(LedgerError::InvalidResponse(
                "empty transaction hash".to_string(),
            ));
        }

        Ok(LedgerReceipt {
            tx_id: parsed.tx_hash,
            sequence: parsed.block_number,
            confirmed_at: parsed.confirmed_at.unwrap_or_else(Utc::now),
        })
    }

    fn describe(&self) -> String {
        format!("{} (contract {})", self.endpoint, self.contract)
    }
}
