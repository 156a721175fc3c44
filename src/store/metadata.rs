use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a turn ended, as recorded in metadata and the index.
///
/// The five validator outcomes plus `Clarify`, used for turns that stopped
/// before validation to ask the user a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnOutcome {
    Approve,
    ApprovePartial,
    Revise,
    Retry,
    Fail,
    Clarify,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::ApprovePartial => "APPROVE_PARTIAL",
            Self::Revise => "REVISE",
            Self::Retry => "RETRY",
            Self::Fail => "FAIL",
            Self::Clarify => "CLARIFY",
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve | Self::ApprovePartial)
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Self::Approve),
            "APPROVE_PARTIAL" => Ok(Self::ApprovePartial),
            "REVISE" => Ok(Self::Revise),
            "RETRY" => Ok(Self::Retry),
            "FAIL" => Ok(Self::Fail),
            "CLARIFY" => Ok(Self::Clarify),
            other => Err(format!("unknown turn outcome '{}'", other)),
        }
    }
}

/// Canonical per-turn metadata, persisted as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub turn_number: u64,
    pub user_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub validation_outcome: TurnOutcome,
    pub quality_score: f64,
    #[serde(default)]
    pub strategy_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degrade_reason: Option<String>,
}

/// Everything persisted for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub metadata: TurnMetadata,
    pub document: String,
    pub answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serde_and_parse() {
        let json = serde_json::to_string(&TurnOutcome::ApprovePartial).unwrap();
        assert_eq!(json, "\"APPROVE_PARTIAL\"");
        assert_eq!("approve_partial".parse::<TurnOutcome>(), Ok(TurnOutcome::ApprovePartial));
        assert!("MAYBE".parse::<TurnOutcome>().is_err());
        assert!(TurnOutcome::Approve.is_approved());
        assert!(!TurnOutcome::Clarify.is_approved());
    }

    #[test]
    fn test_metadata_optional_fields_default() {
        let json = r#"{
            "turn_number": 3,
            "user_id": "u1",
            "session_id": "s1",
            "timestamp": "2026-01-01T00:00:00Z",
            "validation_outcome": "FAIL",
            "quality_score": 0.2
        }"#;
        let meta: TurnMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.turn_number, 3);
        assert!(meta.keywords.is_empty());
        assert!(meta.superseded_by.is_none());
        let out = serde_json::to_string(&meta).unwrap();
        assert!(!out.contains("superseded_by"));
    }
}
