//! Rebuildable SQLite cache of turn metadata.
//!
//! One row per turn, mirroring `metadata.json`. The turn store stays the
//! source of truth: rows can be dropped and regenerated at any time with
//! [`TurnIndex::rebuild`], and [`TurnIndex::ensure_consistent`] repairs
//! drift automatically. The on-disk path of a turn is always computed from
//! (user, turn) and never stored here.

pub mod query;
pub mod rebuild;
pub mod scoring;

pub use query::{IndexStats, RelevantTurn, SessionSummary};
pub use rebuild::{DriftReport, RebuildReport};

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::IndexError;
use crate::store::{TurnMetadata, TurnOutcome};

pub(crate) const COLUMNS: &str = "turn_number, user_id, session_id, timestamp, topic, intent, \
     keywords, validation_outcome, quality_score, strategy_summary, feedback_status, \
     feedback_confidence, superseded_by, degrade_reason";

/// Which rows a rebuild or validation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexScope {
    All,
    User(String),
}

impl IndexScope {
    pub(crate) fn user(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::User(u) => Some(u.as_str()),
        }
    }
}

/// Async-safe handle to the turn index.
///
/// Wraps `TurnIndex` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct IndexHandle {
    inner: Arc<std::sync::Mutex<TurnIndex>>,
}

impl IndexHandle {
    pub fn new(index: TurnIndex) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(index)),
        }
    }

    /// Run a closure with access to the index on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, IndexError>
    where
        F: FnOnce(&TurnIndex) -> Result<R, IndexError> + Send + 'static,
        R: Send + 'static,
    {
        let index = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = index.lock().map_err(|_| IndexError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| IndexError::Other(anyhow::anyhow!("Index task panicked: {}", e)))?
    }

    /// Acquire the index synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TurnIndex>, IndexError> {
        self.inner.lock().map_err(|_| IndexError::LockPoisoned)
    }
}

pub struct TurnIndex {
    conn: Connection,
    quality_floor: f64,
}

impl TurnIndex {
    /// Open (or create) the index database at `path`.
    pub fn open(path: &Path, quality_floor: f64) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| crate::errors::StoreError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        let index = Self {
            conn,
            quality_floor: quality_floor.clamp(0.0, 1.0),
        };
        index.run_migrations()?;
        Ok(index)
    }

    /// In-memory index (for tests).
    pub fn open_in_memory(quality_floor: f64) -> Result<Self, IndexError> {
        let index = Self {
            conn: Connection::open_in_memory()?,
            quality_floor: quality_floor.clamp(0.0, 1.0),
        };
        index.run_migrations()?;
        Ok(index)
    }

    fn run_migrations(&self) -> Result<(), IndexError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS turns (
                turn_number INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                topic TEXT NOT NULL DEFAULT '',
                intent TEXT NOT NULL DEFAULT '',
                keywords TEXT NOT NULL DEFAULT '[]',
                validation_outcome TEXT NOT NULL,
                quality_score REAL NOT NULL,
                strategy_summary TEXT NOT NULL DEFAULT '',
                feedback_status TEXT,
                feedback_confidence REAL,
                superseded_by INTEGER,
                degrade_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS turn_terms (
                turn_number INTEGER PRIMARY KEY,
                terms TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_turns_user ON turns(user_id);
            ",
        )?;
        Ok(())
    }

    pub fn quality_floor(&self) -> f64 {
        self.quality_floor
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert or replace the row for `meta.turn_number`.
    pub fn upsert(&self, meta: &TurnMetadata) -> Result<(), IndexError> {
        upsert_on(&self.conn, meta)
    }

    /// Upsert the row and record the answer's keywords for content matching,
    /// so retrieval never has to read answer files to score a turn.
    pub fn upsert_with_answer(&self, meta: &TurnMetadata, answer: &str) -> Result<(), IndexError> {
        // Safety: IndexHandle's Mutex already guarantees single-threaded access.
        let tx = self.conn.unchecked_transaction()?;
        upsert_on(&tx, meta)?;
        answer_terms_on(&tx, meta.turn_number, answer)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, turn: u64) -> Result<Option<TurnMetadata>, IndexError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM turns WHERE turn_number = ?1", COLUMNS),
                params![turn as i64],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_metadata).transpose()
    }

    pub fn len(&self) -> Result<usize, IndexError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len()? == 0)
    }

    /// Turn numbers indexed within `scope`.
    pub fn keys(&self, scope: &IndexScope) -> Result<BTreeSet<u64>, IndexError> {
        let mut keys = BTreeSet::new();
        match scope.user() {
            Some(user) => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT turn_number FROM turns WHERE user_id = ?1")?;
                let rows = stmt.query_map(params![user], |row| row.get::<_, i64>(0))?;
                for row in rows {
                    keys.insert(row? as u64);
                }
            }
            None => {
                let mut stmt = self.conn.prepare("SELECT turn_number FROM turns")?;
                let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
                for row in rows {
                    keys.insert(row? as u64);
                }
            }
        }
        Ok(keys)
    }

    /// Multiply a turn's quality by `factor`, floored at the quality floor and
    /// never increasing. Records the superseding turn and reason. Returns the
    /// new score.
    pub fn degrade_quality(
        &self,
        turn: u64,
        factor: f64,
        reason: &str,
        superseded_by: Option<u64>,
    ) -> Result<f64, IndexError> {
        let current: Option<f64> = self
            .conn
            .query_row(
                "SELECT quality_score FROM turns WHERE turn_number = ?1",
                params![turn as i64],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(IndexError::NotIndexed { turn })?;
        let updated = degraded_score(current, factor, self.quality_floor);

        self.conn.execute(
            "UPDATE turns SET quality_score = ?1, degrade_reason = ?2,
                 superseded_by = COALESCE(?3, superseded_by)
             WHERE turn_number = ?4",
            params![updated, reason, superseded_by.map(|t| t as i64), turn as i64],
        )?;
        tracing::debug!(turn, from = current, to = updated, reason, "Degraded turn quality");
        Ok(updated)
    }
}

/// `min(current, max(current * factor, floor))` with `factor` clamped to [0, 1].
pub fn degraded_score(current: f64, factor: f64, floor: f64) -> f64 {
    let factor = if factor.is_nan() { 1.0 } else { factor.clamp(0.0, 1.0) };
    (current * factor).max(floor).min(current)
}

pub(crate) fn upsert_on(conn: &Connection, meta: &TurnMetadata) -> Result<(), IndexError> {
    let keywords = serde_json::to_string(&meta.keywords).map_err(|e| IndexError::InvalidRow {
        turn: meta.turn_number,
        message: e.to_string(),
    })?;
    conn.execute(
        &format!(
            "INSERT INTO turns ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(turn_number) DO UPDATE SET
                user_id = excluded.user_id,
                session_id = excluded.session_id,
                timestamp = excluded.timestamp,
                topic = excluded.topic,
                intent = excluded.intent,
                keywords = excluded.keywords,
                validation_outcome = excluded.validation_outcome,
                quality_score = excluded.quality_score,
                strategy_summary = excluded.strategy_summary,
                feedback_status = excluded.feedback_status,
                feedback_confidence = excluded.feedback_confidence,
                superseded_by = excluded.superseded_by,
                degrade_reason = excluded.degrade_reason",
            COLUMNS
        ),
        params![
            meta.turn_number as i64,
            meta.user_id,
            meta.session_id,
            format_timestamp(&meta.timestamp),
            meta.topic,
            meta.intent,
            keywords,
            meta.validation_outcome.as_str(),
            meta.quality_score.clamp(0.0, 1.0),
            meta.strategy_summary,
            meta.feedback_status,
            meta.feedback_confidence,
            meta.superseded_by.map(|t| t as i64),
            meta.degrade_reason,
        ],
    )?;
    Ok(())
}

pub(crate) fn answer_terms_on(conn: &Connection, turn: u64, answer: &str) -> Result<(), IndexError> {
    let terms = crate::text::keywords(answer)
        .into_iter()
        .collect::<Vec<_>>()
        .join(" ");
    conn.execute(
        "INSERT INTO turn_terms (turn_number, terms) VALUES (?1, ?2)
         ON CONFLICT(turn_number) DO UPDATE SET terms = excluded.terms",
        params![turn as i64, terms],
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 so lexical order equals chronological order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Columns as read from SQLite, before validation.
pub(crate) struct RawRow {
    turn_number: i64,
    user_id: String,
    session_id: String,
    timestamp: String,
    topic: String,
    intent: String,
    keywords: String,
    validation_outcome: String,
    quality_score: f64,
    strategy_summary: String,
    feedback_status: Option<String>,
    feedback_confidence: Option<f64>,
    superseded_by: Option<i64>,
    degrade_reason: Option<String>,
}

impl RawRow {
    /// Map a row selected with [`COLUMNS`].
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            turn_number: row.get(0)?,
            user_id: row.get(1)?,
            session_id: row.get(2)?,
            timestamp: row.get(3)?,
            topic: row.get(4)?,
            intent: row.get(5)?,
            keywords: row.get(6)?,
            validation_outcome: row.get(7)?,
            quality_score: row.get(8)?,
            strategy_summary: row.get(9)?,
            feedback_status: row.get(10)?,
            feedback_confidence: row.get(11)?,
            superseded_by: row.get(12)?,
            degrade_reason: row.get(13)?,
        })
    }

    pub(crate) fn into_metadata(self) -> Result<TurnMetadata, IndexError> {
        let turn = self.turn_number as u64;
        let invalid = |message: String| IndexError::InvalidRow { turn, message };
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| invalid(format!("timestamp: {}", e)))?
            .with_timezone(&Utc);
        let keywords: Vec<String> = serde_json::from_str(&self.keywords)
            .map_err(|e| invalid(format!("keywords: {}", e)))?;
        let validation_outcome: TurnOutcome = self.validation_outcome.parse().map_err(invalid)?;
        Ok(TurnMetadata {
            turn_number: turn,
            user_id: self.user_id,
            session_id: self.session_id,
            timestamp,
            topic: self.topic,
            intent: self.intent,
            keywords,
            validation_outcome,
            quality_score: self.quality_score,
            strategy_summary: self.strategy_summary,
            feedback_status: self.feedback_status,
            feedback_confidence: self.feedback_confidence,
            superseded_by: self.superseded_by.map(|t| t as u64),
            degrade_reason: self.degrade_reason,
        })
    }
}

/// Collect mapped rows into metadata, failing on the first invalid row.
pub(crate) fn collect_rows(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> Result<Vec<TurnMetadata>, IndexError> {
    rows.map(|r| r.map_err(IndexError::from).and_then(RawRow::into_metadata))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_meta;

    #[test]
    fn test_upsert_is_idempotent() {
        let index = TurnIndex::open_in_memory(0.1).unwrap();
        let mut meta = sample_meta("u1", "s1", 1);
        index.upsert(&meta).unwrap();
        index.upsert(&meta).unwrap();
        assert_eq!(index.len().unwrap(), 1);

        meta.topic = "updated".to_string();
        index.upsert(&meta).unwrap();
        let row = index.get(1).unwrap().unwrap();
        assert_eq!(row.topic, "updated");
        assert_eq!(row.keywords, meta.keywords);
        assert_eq!(row.validation_outcome, TurnOutcome::Approve);
        assert_eq!(format_timestamp(&row.timestamp), format_timestamp(&meta.timestamp));
    }

    #[test]
    fn test_get_missing_is_none() {
        let index = TurnIndex::open_in_memory(0.1).unwrap();
        assert!(index.get(7).unwrap().is_none());
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn test_keys_by_scope() {
        let index = TurnIndex::open_in_memory(0.1).unwrap();
        index.upsert(&sample_meta("u1", "s1", 1)).unwrap();
        index.upsert(&sample_meta("u2", "s2", 2)).unwrap();
        index.upsert(&sample_meta("u1", "s1", 3)).unwrap();
        assert_eq!(index.keys(&IndexScope::All).unwrap().len(), 3);
        let u1: Vec<u64> = index
            .keys(&IndexScope::User("u1".into()))
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(u1, vec![1, 3]);
    }

    #[test]
    fn test_degrade_quality_monotonic_and_floored() {
        let index = TurnIndex::open_in_memory(0.1).unwrap();
        index.upsert(&sample_meta("u1", "s1", 1)).unwrap();

        let mut previous = 0.9;
        for _ in 0..20 {
            let next = index.degrade_quality(1, 0.5, "superseded", Some(2)).unwrap();
            assert!(next <= previous);
            assert!(next >= 0.1);
            previous = next;
        }
        assert!((previous - 0.1).abs() < 1e-9);

        let row = index.get(1).unwrap().unwrap();
        assert_eq!(row.superseded_by, Some(2));
        assert_eq!(row.degrade_reason.as_deref(), Some("superseded"));
    }

    #[test]
    fn test_degrade_never_increases() {
        assert_eq!(degraded_score(0.5, 3.0, 0.1), 0.5);
        assert_eq!(degraded_score(0.05, 0.5, 0.1), 0.05);
        assert_eq!(degraded_score(0.8, f64::NAN, 0.1), 0.8);
        assert!((degraded_score(0.8, 0.5, 0.1) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_degrade_missing_turn() {
        let index = TurnIndex::open_in_memory(0.1).unwrap();
        assert!(matches!(
            index.degrade_quality(5, 0.5, "x", None),
            Err(IndexError::NotIndexed { turn: 5 })
        ));
    }

    #[test]
    fn test_invalid_row_is_reported() {
        let index = TurnIndex::open_in_memory(0.1).unwrap();
        index.upsert(&sample_meta("u1", "s1", 1)).unwrap();
        index
            .conn()
            .execute("UPDATE turns SET validation_outcome = 'MAYBE'", [])
            .unwrap();
        assert!(matches!(
            index.get(1),
            Err(IndexError::InvalidRow { turn: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_runs_on_blocking_pool() {
        let handle = IndexHandle::new(TurnIndex::open_in_memory(0.1).unwrap());
        let meta = sample_meta("u1", "s1", 4);
        handle.call(move |index| index.upsert(&meta)).await.unwrap();
        let count = handle.call(|index| index.len()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/turn_index.sqlite");
        {
            let index = TurnIndex::open(&path, 0.1).unwrap();
            index.upsert(&sample_meta("u1", "s1", 1)).unwrap();
        }
        let reopened = TurnIndex::open(&path, 0.1).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }
}
