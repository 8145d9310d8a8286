//! SQLite document store
//!
//! Submissions live in one table. Every insert and update, from this process or
//! any other process sharing the database file, is appended to
//! `submission_changes` by triggers. The change feed tails that log.

use super::{ChangeEvent, ChangeFeed, ChangeKind, Result, StoreError, SubmissionStore};
use crate::submission::{AnchorStatus, AnswerSet, Submission, SubmissionPatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    exam_id TEXT,
    student_id TEXT,
    answers_json TEXT NOT NULL DEFAULT '[]',
    submitted_at TEXT,
    anchor_status TEXT,
    submission_hash TEXT,
    ledger_tx_id TEXT,
    ledger_sequence INTEGER,
    ledger_confirmed_at TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(anchor_status);

CREATE TABLE IF NOT EXISTS submission_changes (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    submission_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    anchor_status TEXT,
    changed_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE TRIGGER IF NOT EXISTS trg_submissions_added AFTER INSERT ON submissions
BEGIN
    INSERT INTO submission_changes (submission_id, kind, anchor_status)
    VALUES (NEW.id, 'added', NEW.anchor_status);
END;

CREATE TRIGGER IF NOT EXISTS trg_submissions_modified AFTER UPDATE ON submissions
BEGIN
    INSERT INTO submission_changes (submission_id, kind, anchor_status)
    VALUES (NEW.id, 'modified', NEW.anchor_status);
END;
"#;

const SUBMISSION_COLUMNS: &str = "id, exam_id, student_id, answers_json, submitted_at, \
     anchor_status, submission_hash, ledger_tx_id, ledger_sequence, ledger_confirmed_at";

/// Default interval between change log polls
const DEFAULT_FEED_INTERVAL: Duration = Duration::from_secs(1);

/// Change log rows older than this are pruned by the feed
const CHANGE_RETENTION_SECS: i64 = 3600;
const PRUNE_EVERY: Duration = Duration::from_secs(600);

/// Row as stored, before status/timestamp parsing.
struct SubmissionRow {
    id: String,
    exam_id: Option<String>,
    student_id: Option<String>,
    answers_json: String,
    submitted_at: Option<String>,
    anchor_status: Option<String>,
    submission_hash: Option<String>,
    ledger_tx_id: Option<String>,
    ledger_sequence: Option<i64>,
    ledger_confirmed_at: Option<String>,
}

impl SubmissionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            exam_id: row.get(1)?,
            student_id: row.get(2)?,
            answers_json: row.get(3)?,
            submitted_at: row.get(4)?,
            anchor_status: row.get(5)?,
            submission_hash: row.get(6)?,
            ledger_tx_id: row.get(7)?,
            ledger_sequence: row.get(8)?,
            ledger_confirmed_at: row.get(9)?,
        })
    }

    fn into_submission(self) -> Result<Submission> {
        // Unparseable answers still load; canonicalization treats them as empty
        let answers = serde_json::from_str::<AnswerSet>(&self.answers_json)
            .unwrap_or(AnswerSet::Malformed(Value::String(self.answers_json)));

        let ledger_confirmed_at = self
            .ledger_confirmed_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StoreError::InvalidData(format!("ledger_confirmed_at: {}", e)))
            })
            .transpose()?;

        let ledger_sequence = self
            .ledger_sequence
            .map(|n| {
                u64::try_from(n)
                    .map_err(|_| StoreError::InvalidData(format!("ledger_sequence: {}", n)))
            })
            .transpose()?;

        Ok(Submission {
            anchor_status: parse_status(self.anchor_status.as_deref())?,
            id: self.id,
            exam_id: self.exam_id,
            student_id: self.student_id,
            answers,
            submitted_at: self.submitted_at,
            submission_hash: self.submission_hash,
            ledger_tx_id: self.ledger_tx_id,
            ledger_sequence,
            ledger_confirmed_at,
        })
    }
}

/// SQLite integers are signed; sequences above `i64::MAX` cannot be stored.
fn sequence_to_sql(sequence: u64) -> Result<i64> {
    i64::try_from(sequence)
        .map_err(|_| StoreError::InvalidData(format!("ledger sequence too large: {}", sequence)))
}

fn parse_status(raw: Option<&str>) -> Result<AnchorStatus> {
    raw.unwrap_or_default()
        .parse()
        .map_err(StoreError::InvalidData)
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    feed_interval: Duration,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("Failed to create {:?}: {}", parent, e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!("Submission store opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed_interval: DEFAULT_FEED_INTERVAL,
        })
    }

    /// Create in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed_interval: DEFAULT_FEED_INTERVAL,
        })
    }

    pub fn with_feed_interval(mut self, interval: Duration) -> Self {
        self.feed_interval = interval;
        self
    }

    fn latest_change_seq(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let seq: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM submission_changes", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }
}

fn changes_since(conn: &Mutex<Connection>, after: i64) -> Result<Vec<(i64, ChangeEvent)>> {
    let conn = conn.lock();
    let mut stmt = conn.prepare(
        "SELECT seq, submission_id, kind, anchor_status
         FROM submission_changes WHERE seq > ?1 ORDER BY seq ASC",
    )?;

    let rows = stmt
        .query_map(params![after], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(seq, submission_id, kind, status)| {
            let kind = match kind.as_str() {
                "added" => ChangeKind::Added,
                _ => ChangeKind::Modified,
            };
            Ok((
                seq,
                ChangeEvent {
                    kind,
                    submission_id,
                    anchor_status: parse_status(status.as_deref())?,
                },
            ))
        })
        .collect()
}

fn prune_changes(conn: &Mutex<Connection>, up_to: i64) -> Result<usize> {
    let conn = conn.lock();
    let cutoff = Utc::now().timestamp() - CHANGE_RETENTION_SECS;
    let removed = conn.execute(
        "DELETE FROM submission_changes WHERE seq <= ?1 AND changed_at < ?2",
        params![up_to, cutoff],
    )?;
    Ok(removed)
}

struct FeedState {
    conn: Arc<Mutex<Connection>>,
    interval: Duration,
    watermark: i64,
    buffered: VecDeque<ChangeEvent>,
    last_prune: Instant,
    finished: bool,
}

#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Submission>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM submissions WHERE id = ?1", SUBMISSION_COLUMNS),
                params![id],
                SubmissionRow::from_row,
            )
            .optional()?
        };
        row.map(SubmissionRow::into_submission).transpose()
    }

    async fn find_by_status(
        &self,
        status: AnchorStatus,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        let rows = {
            let conn = self.conn.lock();
            let filter = match status {
                AnchorStatus::Unset => {
                    "(anchor_status IS NULL OR anchor_status IN ('', ?1)) \
                     AND submission_hash IS NULL"
                }
                _ => "anchor_status = ?1",
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM submissions WHERE {} ORDER BY created_at ASC, id ASC LIMIT ?2",
                SUBMISSION_COLUMNS, filter
            ))?;
            let rows = stmt
                .query_map(params![status.as_str(), limit as i64], SubmissionRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter().map(SubmissionRow::into_submission).collect()
    }

    async fn update(&self, id: &str, patch: &SubmissionPatch) -> Result<()> {
        let receipt = patch.receipt.as_ref();
        let sequence = receipt.map(|r| sequence_to_sql(r.sequence)).transpose()?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE submissions SET
                anchor_status = COALESCE(?2, anchor_status),
                submission_hash = COALESCE(?3, submission_hash),
                ledger_tx_id = COALESCE(?4, ledger_tx_id),
                ledger_sequence = COALESCE(?5, ledger_sequence),
                ledger_confirmed_at = COALESCE(?6, ledger_confirmed_at),
                updated_at = strftime('%s', 'now')
             WHERE id = ?1",
            params![
                id,
                patch.anchor_status.map(|s| s.as_str()),
                patch.submission_hash,
                receipt.map(|r| r.tx_id.clone()),
                sequence,
                receipt.map(|r| r.confirmed_at.to_rfc3339()),
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn insert(&self, submission: &Submission) -> Result<()> {
        if submission.id.is_empty() {
            return Err(StoreError::InvalidData("submission id is empty".to_string()));
        }
        let answers_json = serde_json::to_string(&submission.answers)?;
        let sequence = submission.ledger_sequence.map(sequence_to_sql).transpose()?;
        let status = match submission.anchor_status {
            AnchorStatus::Unset => None,
            other => Some(other.as_str()),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO submissions (id, exam_id, student_id, answers_json, submitted_at,
                anchor_status, submission_hash, ledger_tx_id, ledger_sequence, ledger_confirmed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                submission.id,
                submission.exam_id,
                submission.student_id,
                answers_json,
                submission.submitted_at,
                status,
                submission.submission_hash,
                submission.ledger_tx_id,
                sequence,
                submission.ledger_confirmed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn subscribe(&self) -> Result<ChangeFeed> {
        let state = FeedState {
            conn: self.conn.clone(),
            interval: self.feed_interval,
            watermark: self.latest_change_seq()?,
            buffered: VecDeque::new(),
            last_prune: Instant::now(),
            finished: false,
        };
        debug!("Change feed subscribed at seq {}", state.watermark);

        let feed = futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                if let Some(event) = state.buffered.pop_front() {
                    return Some((Ok(event), state));
                }

                tokio::time::sleep(state.interval).await;

                match changes_since(&state.conn, state.watermark) {
                    Ok(changes) => {
                        for (seq, event) in changes {
                            state.watermark = seq;
                            state.buffered.push_back(event);
                        }
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(StoreError::Subscription(e.to_string())), state));
                    }
                }

                if state.last_prune.elapsed() >= PRUNE_EVERY {
                    state.last_prune = Instant::now();
                    match prune_changes(&state.conn, state.watermark) {
                        Ok(n) if n > 0 => debug!("Pruned {} change log entries", n),
                        Ok(_) => {}
                        Err(e) => debug!("Change log prune failed: {}", e),
                    }
                }
            }
        });

        Ok(feed.boxed())
    }
}
