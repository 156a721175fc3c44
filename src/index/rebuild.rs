//! Reconciliation between the index and the turn store.

use std::collections::BTreeSet;

use rusqlite::params;
use serde::Serialize;

use super::{IndexScope, TurnIndex, answer_terms_on, upsert_on};
use crate::errors::IndexError;
use crate::store::{TurnMetadata, TurnStore};
use crate::text;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub indexed: usize,
    /// Structurally incomplete turn records that were not indexed.
    pub skipped: usize,
}

/// Symmetric difference between index keys and complete store records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// In the store but not the index.
    pub missing: Vec<u64>,
    /// In the index but not the store.
    pub orphaned: Vec<u64>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty()
    }
}

impl TurnIndex {
    /// Drop every row in `scope` and repopulate from the store's canonical
    /// metadata, in one transaction.
    pub fn rebuild(&self, store: &TurnStore, scope: &IndexScope) -> Result<RebuildReport, IndexError> {
        let scan = store.scan(scope.user())?;

        // Safety: IndexHandle's Mutex already guarantees single-threaded access.
        let tx = self.conn().unchecked_transaction()?;
        match scope.user() {
            Some(user) => {
                tx.execute(
                    "DELETE FROM turn_terms WHERE turn_number IN
                         (SELECT turn_number FROM turns WHERE user_id = ?1)",
                    params![user],
                )?;
                tx.execute("DELETE FROM turns WHERE user_id = ?1", params![user])?
            }
            None => {
                tx.execute("DELETE FROM turn_terms", [])?;
                tx.execute("DELETE FROM turns", [])?
            }
        };
        for meta in &scan.complete {
            upsert_on(&tx, &with_keywords(meta))?;
            match store.load_answer(&meta.user_id, meta.turn_number) {
                Ok(answer) => answer_terms_on(&tx, meta.turn_number, &answer)?,
                Err(e) => {
                    tracing::debug!(turn = meta.turn_number, error = %e, "No answer to index for turn");
                }
            }
        }
        tx.commit()?;

        let report = RebuildReport {
            indexed: scan.complete.len(),
            skipped: scan.incomplete.len(),
        };
        tracing::info!(
            ?scope,
            indexed = report.indexed,
            skipped = report.skipped,
            "Rebuilt turn index"
        );
        Ok(report)
    }

    pub fn validate(&self, store: &TurnStore, scope: &IndexScope) -> Result<DriftReport, IndexError> {
        let stored: BTreeSet<u64> = store
            .scan(scope.user())?
            .complete
            .iter()
            .map(|m| m.turn_number)
            .collect();
        let indexed = self.keys(scope)?;
        Ok(DriftReport {
            missing: stored.difference(&indexed).copied().collect(),
            orphaned: indexed.difference(&stored).copied().collect(),
        })
    }

    /// Validate, and rebuild the scope when drift is found. Returns the
    /// rebuild report if a rebuild ran.
    pub fn ensure_consistent(
        &self,
        store: &TurnStore,
        scope: &IndexScope,
    ) -> Result<Option<RebuildReport>, IndexError> {
        let drift = self.validate(store, scope)?;
        if drift.is_clean() {
            return Ok(None);
        }
        tracing::warn!(
            ?scope,
            missing = drift.missing.len(),
            orphaned = drift.orphaned.len(),
            "Turn index drift detected, rebuilding"
        );
        self.rebuild(store, scope).map(Some)
    }

    /// Degrade a turn's quality in the index and write the result through to
    /// its `metadata.json`, so a later rebuild keeps the lowered score.
    pub fn degrade_and_persist(
        &self,
        store: &TurnStore,
        turn: u64,
        factor: f64,
        reason: &str,
        superseded_by: Option<u64>,
    ) -> Result<f64, IndexError> {
        let row = self.get(turn)?.ok_or(IndexError::NotIndexed { turn })?;

        // The store is authoritative: persist there first so a failed write
        // leaves the index untouched.
        let mut meta = store.load_metadata(&row.user_id, turn)?;
        let updated = super::degraded_score(row.quality_score, factor, self.quality_floor());
        meta.quality_score = updated;
        meta.degrade_reason = Some(reason.to_string());
        if superseded_by.is_some() {
            meta.superseded_by = superseded_by;
        }
        store.write_metadata(&meta)?;

        self.degrade_quality(turn, factor, reason, superseded_by)
    }
}

/// Re-extract keywords from the topic and strategy summary when the stored
/// metadata carries none.
fn with_keywords(meta: &TurnMetadata) -> TurnMetadata {
    let mut meta = meta.clone();
    if meta.keywords.is_empty() {
        let source = format!("{} {}", meta.topic, meta.strategy_summary);
        meta.keywords = text::keywords(&source).into_iter().collect();
    }
    meta
}
