//! Read paths over the index: session history, search, aggregates and
//! relevance ranking.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::scoring::{CONTENT_MATCH_MIN_LEN, RelevanceSignals, relevance};
use super::{COLUMNS, RawRow, TurnIndex, collect_rows, format_timestamp};
use crate::errors::IndexError;
use crate::store::{TurnMetadata, TurnStore};
use crate::text;

/// Outcome aggregates for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub turns: usize,
    pub outcomes: BTreeMap<String, usize>,
    /// APPROVE + APPROVE_PARTIAL over all turns; 0 for an empty session.
    pub approval_rate: f64,
    pub mean_quality: f64,
}

/// Whole-index aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub rows: usize,
    pub mean_quality: f64,
    pub outcomes: BTreeMap<String, usize>,
}

/// A prior turn ranked for the current query.
#[derive(Debug, Clone)]
pub struct RelevantTurn {
    pub metadata: TurnMetadata,
    pub answer: String,
    pub score: f64,
}

impl TurnIndex {
    /// Turns of a session, newest first.
    pub fn by_session(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<TurnMetadata>, IndexError> {
        let since = since.map(|t| format_timestamp(&t)).unwrap_or_default();
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM turns
             WHERE session_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC, turn_number DESC
             LIMIT ?3",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id, since, limit as i64], RawRow::from_row)?;
        collect_rows(rows)
    }

    /// Case-insensitive substring search on topics, newest first.
    pub fn search_topic(
        &self,
        user_id: Option<&str>,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<TurnMetadata>, IndexError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM turns
             WHERE instr(lower(topic), lower(?1)) > 0
               AND (?2 IS NULL OR user_id = ?2)
             ORDER BY turn_number DESC
             LIMIT ?3",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![needle, user_id, limit as i64], RawRow::from_row)?;
        collect_rows(rows)
    }

    /// Turns ranked by the fraction of `keywords` they carry. Turns with no
    /// overlap are dropped; ties go to the newer turn.
    pub fn rank_by_keywords(
        &self,
        user_id: Option<&str>,
        keywords: &BTreeSet<String>,
        limit: usize,
    ) -> Result<Vec<(TurnMetadata, f64)>, IndexError> {
        let mut ranked: Vec<(TurnMetadata, f64)> = self
            .rows_for_user(user_id)?
            .into_iter()
            .filter_map(|meta| {
                let overlap = text::overlap_ratio(keywords, &keyword_set(&meta));
                (overlap > 0.0).then_some((meta, overlap))
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.turn_number.cmp(&a.0.turn_number))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    pub fn session_summary(&self, session_id: &str) -> Result<SessionSummary, IndexError> {
        let rows = self.by_session(session_id, None, usize::MAX >> 1)?;
        let (outcomes, mean_quality) = aggregate(&rows);
        let approved = rows
            .iter()
            .filter(|m| m.validation_outcome.is_approved())
            .count();
        Ok(SessionSummary {
            session_id: session_id.to_string(),
            turns: rows.len(),
            outcomes,
            approval_rate: ratio(approved, rows.len()),
            mean_quality,
        })
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        let rows = self.rows_for_user(None)?;
        let (outcomes, mean_quality) = aggregate(&rows);
        Ok(IndexStats {
            rows: rows.len(),
            mean_quality,
            outcomes,
        })
    }

    /// Rank a user's prior turns against `query`.
    ///
    /// Scoring uses only indexed data: the row plus the answer keywords
    /// recorded by [`TurnIndex::upsert_with_answer`]. Answer files are read
    /// for the returned turns only; one that cannot be read comes back empty.
    pub fn find_relevant(
        &self,
        store: &TurnStore,
        user_id: &str,
        query: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RelevantTurn>, IndexError> {
        let query_terms = text::keywords(query);
        if query_terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let answer_terms = self.answer_terms(user_id)?;
        let mut ranked: Vec<(TurnMetadata, f64)> = Vec::new();
        for meta in self.rows_for_user(Some(user_id))? {
            let terms = answer_terms
                .get(&meta.turn_number)
                .map(String::as_str)
                .unwrap_or("");
            let age_hours = (now - meta.timestamp).num_seconds().max(0) as f64 / 3600.0;
            let signals = RelevanceSignals {
                keyword_overlap: text::overlap_ratio(&query_terms, &keyword_set(&meta)),
                topic_overlap: text::overlap_ratio(&query_terms, &text::keywords(&meta.topic)),
                content_match: text::contains_any_term(&query_terms, terms, CONTENT_MATCH_MIN_LEN),
                age_hours,
                quality: meta.quality_score,
            };
            let score = relevance(&signals);
            if score > 0.0 {
                ranked.push((meta, score));
            }
        }

        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.turn_number.cmp(&a.0.turn_number))
        });
        ranked.truncate(limit);

        Ok(ranked
            .into_iter()
            .map(|(metadata, score)| {
                let answer = store
                    .load_answer(user_id, metadata.turn_number)
                    .unwrap_or_else(|e| {
                        tracing::debug!(turn = metadata.turn_number, error = %e, "No answer for indexed turn");
                        String::new()
                    });
                RelevantTurn {
                    metadata,
                    answer,
                    score,
                }
            })
            .collect())
    }

    /// Indexed answer keywords of a user's turns, space-joined.
    fn answer_terms(&self, user_id: &str) -> Result<HashMap<u64, String>, IndexError> {
        let mut stmt = self.conn().prepare(
            "SELECT t.turn_number, t.terms FROM turn_terms t
             JOIN turns r ON r.turn_number = t.turn_number
             WHERE r.user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
        })?;
        let mut terms = HashMap::new();
        for row in rows {
            let (turn, text) = row?;
            terms.insert(turn, text);
        }
        Ok(terms)
    }

    fn rows_for_user(&self, user_id: Option<&str>) -> Result<Vec<TurnMetadata>, IndexError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {} FROM turns WHERE (?1 IS NULL OR user_id = ?1) ORDER BY turn_number",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], RawRow::from_row)?;
        collect_rows(rows)
    }
}

/// Stored keywords, normalized; falls back to the topic when none were stored.
fn keyword_set(meta: &TurnMetadata) -> BTreeSet<String> {
    if meta.keywords.is_empty() {
        return text::keywords(&meta.topic);
    }
    meta.keywords
        .iter()
        .flat_map(|k| text::keywords(k))
        .collect()
}

fn aggregate(rows: &[TurnMetadata]) -> (BTreeMap<String, usize>, f64) {
    let mut outcomes = BTreeMap::new();
    let mut total_quality = 0.0;
    for meta in rows {
        *outcomes
            .entry(meta.validation_outcome.to_string())
            .or_insert(0) += 1;
        total_quality += meta.quality_score;
    }
    let mean = if rows.is_empty() {
        0.0
    } else {
        total_quality / rows.len() as f64
    };
    (outcomes, mean)
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
