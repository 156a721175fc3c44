//! Structured decisions parsed from strategy output.
//!
//! Every decision enum has one variant per known value plus `Unparseable`,
//! which keeps the raw text so the controller can log it before applying its
//! conservative default.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Clamp a confidence value to [0.0, 1.0]; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Output of the query analyzer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub topic: String,
    pub intent: String,
    pub keywords: Vec<String>,
    pub analysis: String,
}

/// Output of the context gatherer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatheredContext {
    pub context: String,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReflectionDecision {
    Proceed { reasoning: String, confidence: f64 },
    Clarify { question: String, confidence: f64 },
    Unparseable { raw: String },
}

impl ReflectionDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Proceed { .. } => "PROCEED",
            Self::Clarify { .. } => "CLARIFY",
            Self::Unparseable { .. } => "UNPARSEABLE",
        }
    }
}

/// One tool invocation requested by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Whether the call changes external state and so must pass the permission gate.
    #[serde(default)]
    pub mutating: bool,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            instruction: instruction.into(),
            args: serde_json::Value::Null,
            mutating: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub goals: Vec<String>,
    pub approach: String,
    pub success_criteria: String,
    pub tools: Vec<ToolRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// Run the requested tools, then plan again.
    Execute(Plan),
    /// Enough material gathered; go to synthesis.
    Synthesize(Plan),
    /// End the turn with a question for the user.
    Clarify { plan: Plan, question: String },
    Unparseable { raw: String },
}

impl PlanDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Execute(_) => "EXECUTE",
            Self::Synthesize(_) => "COMPLETE",
            Self::Clarify { .. } => "CLARIFY",
            Self::Unparseable { .. } => "UNPARSEABLE",
        }
    }

    pub fn plan(&self) -> Option<&Plan> {
        match self {
            Self::Execute(p) | Self::Synthesize(p) | Self::Clarify { plan: p, .. } => Some(p),
            Self::Unparseable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    /// Ran fine but produced no usable results.
    Empty,
    Error,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Empty => write!(f, "empty"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A claim as reported by an executor, before it enters the claim store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimDraft {
    pub content: String,
    #[serde(default = "default_claim_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub source: String,
}

fn default_claim_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub tool_selected: String,
    pub status: ToolStatus,
    pub result: String,
    pub claims: Vec<ClaimDraft>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisDecision {
    Answer { answer: String },
    Unanswerable { reason: String },
    Unparseable { raw: String },
}

/// Structured failure reason reported by the validator or set by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    StaleEvidence,
    UnverifiableReference,
    LowConfidenceOverride,
    TermMismatchOverride,
    SubjectSubstitution,
    SynthesisUnanswerable,
}

impl FailureReason {
    /// Parse a reason code, ignoring case and `_`/`-`/space separators.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "staleevidence" => Some(Self::StaleEvidence),
            "unverifiablereference" => Some(Self::UnverifiableReference),
            "lowconfidenceoverride" => Some(Self::LowConfidenceOverride),
            "termmismatchoverride" => Some(Self::TermMismatchOverride),
            "subjectsubstitution" => Some(Self::SubjectSubstitution),
            "synthesisunanswerable" => Some(Self::SynthesisUnanswerable),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StaleEvidence => "stale_evidence",
            Self::UnverifiableReference => "unverifiable_reference",
            Self::LowConfidenceOverride => "low_confidence_override",
            Self::TermMismatchOverride => "term_mismatch_override",
            Self::SubjectSubstitution => "subject_substitution",
            Self::SynthesisUnanswerable => "synthesis_unanswerable",
        };
        write!(f, "{}", s)
    }
}

/// Hallucination checks reported by the validator. Absent checks pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationChecks {
    pub query_terms_in_context: bool,
    pub answer_terms_in_context: bool,
    pub subject_substitution: bool,
}

impl Default for ValidationChecks {
    fn default() -> Self {
        Self {
            query_terms_in_context: true,
            answer_terms_in_context: true,
            subject_substitution: false,
        }
    }
}

impl ValidationChecks {
    pub fn all_pass(&self) -> bool {
        self.query_terms_in_context && self.answer_terms_in_context && !self.subject_substitution
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalStatus {
    pub goal: String,
    pub fulfilled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub confidence: f64,
    pub issues: Vec<String>,
    pub checks: ValidationChecks,
    pub goal_statuses: Vec<GoalStatus>,
    pub suggested_fixes: Vec<String>,
    pub failed_claims: Vec<String>,
    pub failed_sources: Vec<String>,
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidatorDecision {
    Approve(ValidationReport),
    ApprovePartial(ValidationReport),
    Revise(ValidationReport),
    Retry(ValidationReport),
    Fail(ValidationReport),
    Unparseable { raw: String },
}

impl ValidatorDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve(_) => "APPROVE",
            Self::ApprovePartial(_) => "APPROVE_PARTIAL",
            Self::Revise(_) => "REVISE",
            Self::Retry(_) => "RETRY",
            Self::Fail(_) => "FAIL",
            Self::Unparseable { .. } => "UNPARSEABLE",
        }
    }

    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            Self::Approve(r)
            | Self::ApprovePartial(r)
            | Self::Revise(r)
            | Self::Retry(r)
            | Self::Fail(r) => Some(r),
            Self::Unparseable { .. } => None,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.report().map(|r| r.confidence).unwrap_or(0.0)
    }
}
