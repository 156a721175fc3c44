//! Answer guards: false-approval overrides, unanswerable classification,
//! partial-approval messages and the final sanitizer.

use super::tools::ToolLedger;
use crate::strategy::{FailureReason, GoalStatus, ValidationReport};
use crate::util::looks_like_json;

/// Shown instead of an empty, malformed or internal answer.
pub const FALLBACK_ANSWER: &str =
    "I wasn't able to put together a reliable answer to that. Could you rephrase or add a bit more detail?";

/// Placeholders strategies use internally; never shown to a user.
const INTERNAL_SENTINELS: &[&str] = &[
    "[no_answer]",
    "[internal]",
    "<no_answer>",
    "__unanswerable__",
    "null",
    "none",
    "n/a",
];

/// Phrases meaning "research came back empty".
const NO_RESULT_MARKERS: &[&str] = &[
    "no results",
    "no relevant results",
    "nothing found",
    "not found",
    "could not find",
    "couldn't find",
    "no information",
    "no data",
];

/// Why an approval must be overridden into a RETRY, if it must.
pub fn approval_override(report: &ValidationReport, threshold: f64) -> Option<(FailureReason, String)> {
    if report.checks.subject_substitution {
        return Some((
            FailureReason::SubjectSubstitution,
            "answer substitutes a different subject than the one asked about".to_string(),
        ));
    }
    if !report.checks.query_terms_in_context {
        return Some((
            FailureReason::TermMismatchOverride,
            "query terms are missing from the gathered context".to_string(),
        ));
    }
    if !report.checks.answer_terms_in_context {
        return Some((
            FailureReason::TermMismatchOverride,
            "answer terms are not supported by the gathered context".to_string(),
        ));
    }
    if report.confidence < threshold {
        return Some((
            FailureReason::LowConfidenceOverride,
            format!(
                "approval confidence {:.2} is below the {:.2} threshold",
                report.confidence, threshold
            ),
        ));
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unanswerable {
    /// Research was already exhausted: tell the user, no retry.
    CouldNotFind,
    /// Treat as an implicit RETRY.
    Retry,
}

/// Classify a synthesizer's "unanswerable" against this turn's tool ledger.
pub fn classify_unanswerable(reason: &str, ledger: &ToolLedger) -> Unanswerable {
    let lower = reason.to_lowercase();
    let names_dead_path = ledger
        .exhausted
        .iter()
        .chain(ledger.failed_tools.iter())
        .any(|tool| lower.contains(&tool.to_lowercase()));
    if names_dead_path {
        return Unanswerable::CouldNotFind;
    }
    let no_results = NO_RESULT_MARKERS.iter().any(|m| lower.contains(m));
    if no_results && ledger.research_exhausted() {
        return Unanswerable::CouldNotFind;
    }
    Unanswerable::Retry
}

pub fn could_not_find_message(query: &str, reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        format!("I searched but could not find an answer to \"{}\".", query.trim())
    } else {
        format!(
            "I searched but could not find an answer to \"{}\" ({}).",
            query.trim(),
            reason.trim_end_matches('.')
        )
    }
}

/// Note appended to an APPROVE_PARTIAL answer naming fulfilled and
/// unfulfilled goals. `None` when every goal is fulfilled or none were reported.
pub fn partial_message(goals: &[GoalStatus]) -> Option<String> {
    let (done, open): (Vec<&GoalStatus>, Vec<&GoalStatus>) = goals.iter().partition(|g| g.fulfilled);
    if open.is_empty() {
        return None;
    }
    let names = |gs: &[&GoalStatus]| gs.iter().map(|g| g.goal.as_str()).collect::<Vec<_>>().join("; ");
    let mut msg = String::from("This answer is partial.");
    if !done.is_empty() {
        msg.push_str(&format!(" Covered: {}.", names(&done)));
    }
    msg.push_str(&format!(" Not yet covered: {}.", names(&open)));
    Some(msg)
}

/// Whether `answer` must not be shown to a user as-is.
pub fn is_internal_payload(answer: &str) -> bool {
    let trimmed = answer.trim();
    trimmed.is_empty()
        || looks_like_json(trimmed)
        || INTERNAL_SENTINELS.contains(&trimmed.to_lowercase().as_str())
}

pub fn sanitize_answer(answer: &str) -> String {
    if is_internal_payload(answer) {
        FALLBACK_ANSWER.to_string()
    } else {
        answer.trim().to_string()
    }
}
