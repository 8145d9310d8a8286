//! Anchoring worker configuration
//!
//! Every option can be given on the command line or through the environment.
//! The ledger is only used for real when endpoint, key and contract address
//! are all present; otherwise anchors are simulated.

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder contract address that means "no contract deployed".
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("no data directory available; set DATABASE_PATH")]
    NoDataDir,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ledger connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub endpoint: Option<String>,
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    pub contract_address: Option<String>,
    pub request_timeout: Duration,
    /// Delay of a simulated anchor
    pub simulate_delay: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            contract_address: None,
            request_timeout: Duration::from_secs(120),
            simulate_delay: Duration::from_secs(1),
        }
    }
}

impl LedgerConfig {
    /// `(endpoint, api_key, contract)` when a real ledger is configured.
    pub fn live_settings(&self) -> Option<(&str, &str, &str)> {
        let endpoint = non_empty(&self.endpoint)?;
        let api_key = non_empty(&self.api_key)?;
        let contract = non_empty(&self.contract_address)?;
        if contract.eq_ignore_ascii_case(ZERO_ADDRESS) {
            return None;
        }
        Some((endpoint, api_key, contract))
    }

    pub fn is_simulated(&self) -> bool {
        self.live_settings().is_none()
    }
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("contract_address", &self.contract_address)
            .field("request_timeout", &self.request_timeout)
            .field("simulate_delay", &self.simulate_delay)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Complete worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub ledger: LedgerConfig,
    /// Submissions fetched per drain page
    pub batch_size: usize,
    /// Submissions processed at once within a page
    pub concurrency: usize,
    pub max_attempts: u32,
    /// Backoff base; the delay after attempt n is `retry_base * 2^n`
    pub retry_base: Duration,
    /// Wait before resubscribing after a change feed failure
    pub resubscribe_delay: Duration,
    /// How often the SQLite change feed polls its log
    pub feed_poll_interval: Duration,
    pub database_path: PathBuf,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_secs(1),
            resubscribe_delay: Duration::from_secs(5),
            feed_poll_interval: Duration::from_secs(1),
            database_path: PathBuf::from("submissions.db"),
        }
    }
}

impl AnchorConfig {
    /// Build configuration from environment variables alone.
    pub fn from_env() -> Result<Self, ConfigError> {
        EnvOnly::try_parse_from(["exam-anchor"])
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .args
            .into_config()
    }

    pub fn retry_policy(&self) -> crate::ledger::RetryPolicy {
        crate::ledger::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base,
        }
    }
}

#[derive(Parser)]
struct EnvOnly {
    #[command(flatten)]
    args: AnchorArgs,
}

/// Command line / environment options for the worker.
#[derive(Args, Clone)]
pub struct AnchorArgs {
    /// Ledger gateway URL
    #[arg(long, env = "LEDGER_RPC_URL")]
    pub ledger_url: Option<String>,

    /// Ledger credential (bearer key)
    #[arg(long, env = "LEDGER_PRIVATE_KEY", hide_env_values = true)]
    pub ledger_key: Option<String>,

    /// Target contract address
    #[arg(long, env = "LEDGER_CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Submissions per drain page
    #[arg(long, env = "ANCHOR_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Concurrent submissions per page (defaults to the batch size)
    #[arg(long, env = "ANCHOR_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Ledger attempts per submission
    #[arg(long, env = "ANCHOR_MAX_RETRIES", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_retries: u32,

    /// Backoff base in milliseconds
    #[arg(long, env = "ANCHOR_RETRY_BASE_MS", default_value_t = 1000)]
    pub retry_base_ms: u64,

    /// Simulated anchor delay in milliseconds
    #[arg(long, env = "ANCHOR_SIMULATE_DELAY_MS", default_value_t = 1000)]
    pub simulate_delay_ms: u64,

    /// Seconds to wait before resubscribing to the change feed
    #[arg(long, env = "ANCHOR_RESUBSCRIBE_SECS", default_value_t = 5)]
    pub resubscribe_secs: u64,

    /// Change feed poll interval in milliseconds
    #[arg(long, env = "ANCHOR_FEED_POLL_MS", default_value_t = 1000)]
    pub feed_poll_ms: u64,

    /// SQLite database file (defaults to the user data directory)
    #[arg(long, env = "DATABASE_PATH")]
    pub database_path: Option<PathBuf>,
}

impl fmt::Debug for AnchorArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorArgs")
            .field("ledger_url", &self.ledger_url)
            .field("ledger_key", &self.ledger_key.as_ref().map(|_| "[REDACTED]"))
            .field("contract_address", &self.contract_address)
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("database_path", &self.database_path)
            .finish()
    }
}

impl AnchorArgs {
    pub fn into_config(self) -> Result<AnchorConfig, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch size"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Zero("max retries"));
        }
        let concurrency = self.concurrency.unwrap_or(self.batch_size);
        if concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }

        let database_path = match self.database_path {
            Some(path) => path,
            None => dirs::data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("exam-anchor")
                .join("submissions.db"),
        };

        Ok(AnchorConfig {
            ledger: LedgerConfig {
                endpoint: self.ledger_url,
                api_key: self.ledger_key,
                contract_address: self.contract_address,
                simulate_delay: Duration::from_millis(self.simulate_delay_ms),
                ..Default::default()
            },
            batch_size: self.batch_size,
            concurrency,
            max_attempts: self.max_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
            resubscribe_delay: Duration::from_secs(self.resubscribe_secs),
            feed_poll_interval: Duration::from_millis(self.feed_poll_ms),
            database_path,
        })
    }
}
