//! Exam submission integrity anchoring
//!
//! Watches a document store for submitted exam answers, hashes a canonical
//! form of each submission and records the hash on an external ledger, then
//! writes the outcome back to the store.
//!
//! ## Module Structure
//!
//! - `submission`: Submission records, anchor status, store patches
//! - `canonical`: Canonical serialization and SHA-256 hashing
//! - `ledger`: Ledger trait, retrying submitter, simulated and HTTP ledgers
//! - `store`: Document store trait, in-memory and SQLite stores
//! - `worker`: Processor, batch drainer and change feed listener
//! - `verify`: Recompute and compare anchored hashes
//! - `config`: Worker configuration

pub mod canonical;
pub mod config;
pub mod ledger;
pub mod store;
pub mod submission;
pub mod verify;
pub mod worker;

pub use canonical::{canonicalize, hash_canonical, submission_hash};
pub use config::{AnchorArgs, AnchorConfig, ConfigError, LedgerConfig};
pub use ledger::{
    ledger_from_config, HttpLedger, Ledger, LedgerError, LedgerSubmitter, RetryPolicy,
    SimulatedLedger,
};
pub use store::{
    ChangeEvent, ChangeFeed, ChangeKind, MemoryStore, SqliteStore, StoreError, SubmissionStore,
};
pub use submission::{
    AnchorStatus, Answer, AnswerSet, LedgerReceipt, Submission, SubmissionPatch,
};
pub use verify::{verify_submission, VerificationReport};
pub use worker::{
    spawn_anchor_worker, AnchorWorker, BatchDrainer, ChangeFeedListener, DrainReport,
    ProcessOutcome, SubmissionProcessor, WorkerContext,
};
