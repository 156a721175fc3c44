//! Execution-state header carried by every working document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Default number of decisions kept in the header history.
pub const DEFAULT_HISTORY_CAP: usize = 10;

/// Pipeline phase a document is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Analyze,
    Gather,
    Reflect,
    Plan,
    Execute,
    Synthesize,
    Validate,
    Save,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analyze => "analyze",
            Self::Gather => "gather",
            Self::Reflect => "reflect",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Synthesize => "synthesize",
            Self::Validate => "validate",
            Self::Save => "save",
        };
        write!(f, "{}", name)
    }
}

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub phase: PhaseKind,
    pub decision: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Execution-state header: phase, iteration, error streak and a capped
/// decision history (oldest entries dropped first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub phase: PhaseKind,
    pub iteration: u32,
    pub max_iterations: u32,
    pub consecutive_errors: u32,
    history: VecDeque<DecisionRecord>,
    history_cap: usize,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(history_cap: usize) -> Self {
        Self {
            phase: PhaseKind::Analyze,
            iteration: 1,
            max_iterations: 1,
            consecutive_errors: 0,
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
            updated_at: Utc::now(),
        }
    }

    /// Move to `phase`. Re-entering the current phase advances the iteration
    /// counter; entering a different phase resets it to 1.
    pub fn enter_phase(&mut self, phase: PhaseKind, max_iterations: u32) {
        if self.phase == phase {
            self.iteration += 1;
        } else {
            self.phase = phase;
            self.iteration = 1;
        }
        self.max_iterations = max_iterations.max(1);
        self.touch();
    }

    /// Move to `phase` at an iteration the caller counts itself, for loops
    /// that pass through other phases between iterations.
    pub fn enter_phase_at(&mut self, phase: PhaseKind, iteration: u32, max_iterations: u32) {
        self.phase = phase;
        self.iteration = iteration.max(1);
        self.max_iterations = max_iterations.max(self.iteration);
        self.touch();
    }

    pub fn record_decision(
        &mut self,
        phase: PhaseKind,
        decision: impl Into<String>,
        detail: impl Into<String>,
    ) {
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(DecisionRecord {
            phase,
            decision: decision.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn record_error(&mut self) {
        self.consecutive_errors += 1;
        self.touch();
    }

    pub fn reset_errors(&mut self) {
        self.consecutive_errors = 0;
        self.touch();
    }

    pub fn history(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_decision(&self) -> Option<&DecisionRecord> {
        self.history.back()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}
