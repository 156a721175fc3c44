use serde::Serialize;
use std::collections::BTreeSet;

use crate::strategy::{FailureReason, ValidationReport};

/// Cumulative skip list carried across RETRY attempts of one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryFailureContext {
    /// Most recent structured reason.
    pub reason: Option<FailureReason>,
    pub failed_claims: BTreeSet<String>,
    pub failed_sources: BTreeSet<String>,
    /// Field-level mismatches and issues reported by the validator.
    pub mismatches: Vec<String>,
    /// Number of merged attempts.
    pub attempt: u32,
}

impl RetryFailureContext {
    /// Fold one rejected attempt in. Identifiers are unioned, never replaced.
    pub fn merge(&mut self, report: &ValidationReport) {
        self.failed_claims
            .extend(report.failed_claims.iter().cloned());
        self.failed_sources
            .extend(report.failed_sources.iter().cloned());
        for issue in &report.issues {
            if !self.mismatches.contains(issue) {
                self.mismatches.push(issue.clone());
            }
        }
        if report.failure_reason.is_some() {
            self.reason = report.failure_reason;
        }
        self.attempt += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.attempt == 0
    }

    pub fn skips_source(&self, source: &str) -> bool {
        self.failed_sources.contains(source)
    }

    /// Markdown summary for planners and the document.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Retry attempt {}", self.attempt + 1)];
        if let Some(reason) = self.reason {
            lines.push(format!("Previous failure: {}", reason));
        }
        if !self.failed_claims.is_empty() {
            let ids: Vec<&str> = self.failed_claims.iter().map(String::as_str).collect();
            lines.push(format!("Do not reuse claims: {}", ids.join(", ")));
        }
        if !self.failed_sources.is_empty() {
            let ids: Vec<&str> = self.failed_sources.iter().map(String::as_str).collect();
            lines.push(format!("Do not reuse sources: {}", ids.join(", ")));
        }
        for m in &self.mismatches {
            lines.push(format!("- {}", m));
        }
        lines.join("\n")
    }
}
