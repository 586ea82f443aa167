//! Per-recipe SQLite metrics store.
//!
//! Records hold one pipeline invocation each; every record owns one feedback
//! row per feedback function. The background scorer moves feedback rows
//! through `waiting -> running -> done | failed | skipped`, and the
//! evaluation loop reads point-in-time status counts.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::scoring::{FeedbackInput, FeedbackKind};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS apps (
    app_id     TEXT PRIMARY KEY,
    recipe     TEXT NOT NULL,
    run_id     TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    record_id  TEXT PRIMARY KEY,
    app_id     TEXT NOT NULL,
    run_id     TEXT NOT NULL,
    input      TEXT NOT NULL,
    output     TEXT,
    contexts   TEXT NOT NULL,
    expected   TEXT,
    error      TEXT,
    latency_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS feedbacks (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id  TEXT NOT NULL REFERENCES records(record_id),
    name       TEXT NOT NULL,
    status     TEXT NOT NULL,
    score      REAL,
    error      TEXT,
    attempts   INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedbacks_status ON feedbacks(status);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Waiting,
    Running,
    Done,
    Failed,
    Skipped,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of feedback rows per status bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub done: u64,
    pub running: u64,
    pub waiting: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl StatusCounts {
    fn slot(&mut self, status: FeedbackStatus) -> &mut u64 {
        match status {
            FeedbackStatus::Done => &mut self.done,
            FeedbackStatus::Running => &mut self.running,
            FeedbackStatus::Waiting => &mut self.waiting,
            FeedbackStatus::Failed => &mut self.failed,
            FeedbackStatus::Skipped => &mut self.skipped,
        }
    }

    /// Feedbacks that will not change any more.
    pub fn finished(&self) -> u64 {
        self.done + self.failed + self.skipped
    }

    #[cfg(test)]
    pub fn total(&self) -> u64 {
        self.finished() + self.running + self.waiting
    }
}

/// One pipeline invocation ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub app_id: &'a str,
    pub run_id: &'a str,
    pub input: &'a str,
    pub output: Option<&'a str>,
    pub contexts: &'a [String],
    pub expected: Option<&'a str>,
    pub error: Option<&'a str>,
    pub latency_ms: u64,
}

/// A feedback row claimed by a scorer worker.
#[derive(Debug, Clone)]
pub struct ClaimedFeedback {
    pub id: i64,
    pub record_id: String,
    pub kind: FeedbackKind,
    pub attempts: u32,
    pub input: FeedbackInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackScore {
    pub record_id: String,
    pub name: String,
    pub score: f64,
    pub latency_ms: u64,
}

pub struct MetricsStore {
    conn: Mutex<Connection>,
}

impl MetricsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Journal mode set");
        debug!(path = %path.display(), "Opened metrics store");
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Remove every app, record and feedback row.
    pub fn reset(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM feedbacks; DELETE FROM records; DELETE FROM apps;")?;
        info!("Metrics store reset");
        Ok(())
    }

    pub fn register_app(&self, app_id: &str, recipe: &str, run_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO apps (app_id, recipe, run_id, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app_id) DO UPDATE SET recipe = excluded.recipe, run_id = excluded.run_id",
            params![app_id, recipe, run_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Persist a record with one feedback row per `kinds` entry, all in
    /// `status`. Either everything is written or nothing is.
    pub fn insert_record(
        &self,
        record: &NewRecord<'_>,
        kinds: &[FeedbackKind],
        status: FeedbackStatus,
    ) -> Result<String> {
        let record_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let contexts = serde_json::to_string(record.contexts).unwrap_or_else(|_| "[]".into());

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO records
                (record_id, app_id, run_id, input, output, contexts, expected, error, latency_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record_id,
                record.app_id,
                record.run_id,
                record.input,
                record.output,
                contexts,
                record.expected,
                record.error,
                record.latency_ms as i64,
                now,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO feedbacks (record_id, name, status, error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for kind in kinds {
                stmt.execute(params![
                    record_id,
                    kind.as_str(),
                    status.as_str(),
                    record.error,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(record_id)
    }

    /// Atomically take the oldest waiting feedback and mark it running.
    pub fn claim_next(&self) -> Result<Option<ClaimedFeedback>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row = tx
            .query_row(
                "SELECT f.id, f.record_id, f.name, f.attempts, r.input, r.output, r.contexts, r.expected
                 FROM feedbacks f JOIN records r ON r.record_id = f.record_id
                 WHERE f.status = 'waiting'
                 ORDER BY f.id
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, record_id, name, attempts, input, output, contexts, expected)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE feedbacks SET status = 'running', attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        let kind = match name.parse::<FeedbackKind>() {
            Ok(kind) => kind,
            Err(reason) => {
                drop(conn);
                self.finish(id, FeedbackStatus::Skipped, None, Some(&reason))?;
                return self.claim_next();
            }
        };

        Ok(Some(ClaimedFeedback {
            id,
            record_id,
            kind,
            attempts: attempts as u32 + 1,
            input: FeedbackInput {
                query: input,
                response: output.unwrap_or_default(),
                contexts: serde_json::from_str(&contexts).unwrap_or_default(),
                expected,
            },
        }))
    }

    pub fn complete(&self, id: i64, score: f64) -> Result<()> {
        self.finish(id, FeedbackStatus::Done, Some(score), None)
    }

    pub fn fail(&self, id: i64, error: &str) -> Result<()> {
        self.finish(id, FeedbackStatus::Failed, None, Some(error))
    }

    pub fn skip(&self, id: i64, reason: &str) -> Result<()> {
        self.finish(id, FeedbackStatus::Skipped, None, Some(reason))
    }

    /// Hand a running feedback back to the queue.
    pub fn release(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE feedbacks SET status = 'waiting', updated_at = ?2 WHERE id = ?1 AND status = 'running'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Requeue rows left running by a scorer that went away.
    pub fn recover_stalled(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE feedbacks SET status = 'waiting', updated_at = ?1 WHERE status = 'running'",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    fn finish(
        &self,
        id: i64,
        status: FeedbackStatus,
        score: Option<f64>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE feedbacks SET status = ?2, score = ?3, error = ?4, updated_at = ?5 WHERE id = ?1",
            params![id, status.as_str(), score, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM feedbacks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            if let Some(status) = FeedbackStatus::parse(&status) {
                *counts.slot(status) += n as u64;
            }
        }
        Ok(counts)
    }

    pub fn apps(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT app_id FROM apps ORDER BY app_id")?;
        let apps = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(apps)
    }

    /// Finished scores for one app, one row per (record, feedback function).
    pub fn feedback_scores(&self, app_id: &str) -> Result<Vec<FeedbackScore>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT f.record_id, f.name, f.score, r.latency_ms
             FROM feedbacks f JOIN records r ON r.record_id = f.record_id
             WHERE r.app_id = ?1 AND f.status = 'done' AND f.score IS NOT NULL
             ORDER BY f.id",
        )?;
        let scores = stmt
            .query_map(params![app_id], |row| {
                Ok(FeedbackScore {
                    record_id: row.get(0)?,
                    name: row.get(1)?,
                    score: row.get(2)?,
                    latency_ms: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(scores)
    }

    #[cfg(test)]
    pub fn record_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
