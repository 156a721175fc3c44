//! The working document: a single accumulating artifact per turn.
//!
//! Sections are numbered 0..=7 and the numbers are permanent identifiers.
//! §0 holds the raw query from construction onwards and accepts exactly one
//! `set_query` call; every other section follows an explicit
//! create/replace/concatenate lifecycle. The only removal is `clear_from`,
//! which the controller uses to regenerate §3..§7 on retry.

pub mod render;
pub mod state;

pub use render::{Budget, DocumentView};
pub use state::{DecisionRecord, ExecutionState, PhaseKind};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::DocumentError;

/// Separator used by `extend` and `append_to`.
pub const SECTION_SEPARATOR: &str = "\n\n";

/// Permanent section identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SectionId {
    QueryAnalysis = 0,
    GatheredContext = 1,
    Reflection = 2,
    Plan = 3,
    Execution = 4,
    ToolResults = 5,
    Synthesis = 6,
    Validation = 7,
}

impl SectionId {
    pub const ALL: [SectionId; 8] = [
        SectionId::QueryAnalysis,
        SectionId::GatheredContext,
        SectionId::Reflection,
        SectionId::Plan,
        SectionId::Execution,
        SectionId::ToolResults,
        SectionId::Synthesis,
        SectionId::Validation,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn default_title(self) -> &'static str {
        match self {
            Self::QueryAnalysis => "Query Analysis",
            Self::GatheredContext => "Gathered Context",
            Self::Reflection => "Reflection",
            Self::Plan => "Plan",
            Self::Execution => "Execution",
            Self::ToolResults => "Tool Results",
            Self::Synthesis => "Synthesis",
            Self::Validation => "Validation",
        }
    }
}

impl TryFrom<u8> for SectionId {
    type Error = DocumentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(DocumentError::InvalidSection { section: value })
    }
}

impl From<SectionId> for u8 {
    fn from(id: SectionId) -> Self {
        id.number()
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "§{}", self.number())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    pub content: String,
}

/// A source consulted during the turn (web page, memory entry, prior turn).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct WorkingDocument {
    pub turn: u64,
    pub session_id: String,
    pub user_id: String,
    query: String,
    query_set: bool,
    sections: BTreeMap<SectionId, Section>,
    pub state: ExecutionState,
    sources: Vec<SourceRef>,
    claim_ids: Vec<String>,
}

impl WorkingDocument {
    /// Create the document for a new turn. The raw query is stored in §0
    /// immediately so it is readable before analysis runs.
    pub fn new(
        turn: u64,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        query: impl Into<String>,
        history_cap: usize,
    ) -> Self {
        let query = query.into();
        let mut sections = BTreeMap::new();
        sections.insert(
            SectionId::QueryAnalysis,
            Section {
                title: SectionId::QueryAnalysis.default_title().to_string(),
                content: query.clone(),
            },
        );
        Self {
            turn,
            session_id: session_id.into(),
            user_id: user_id.into(),
            query,
            query_set: false,
            sections,
            state: ExecutionState::new(history_cap),
            sources: Vec::new(),
            claim_ids: Vec::new(),
        }
    }

    /// The raw user query.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Replace §0 with the query analysis. Allowed once.
    pub fn set_query(&mut self, analysis: impl Into<String>) -> Result<(), DocumentError> {
        if self.query_set {
            return Err(DocumentError::QueryImmutable);
        }
        let content = format!("**Query:** {}\n\n{}", self.query, analysis.into());
        if let Some(section) = self.sections.get_mut(&SectionId::QueryAnalysis) {
            section.content = content;
        }
        self.query_set = true;
        Ok(())
    }

    /// Create a section. Fails if it already exists.
    pub fn append(
        &mut self,
        id: SectionId,
        title: Option<&str>,
        content: impl Into<String>,
    ) -> Result<(), DocumentError> {
        if self.sections.contains_key(&id) {
            return Err(DocumentError::SectionExists {
                section: id.number(),
            });
        }
        self.sections.insert(
            id,
            Section {
                title: title.unwrap_or(id.default_title()).to_string(),
                content: content.into(),
            },
        );
        Ok(())
    }

    /// Replace a section's content, keeping its title. Fails if absent.
    pub fn update(&mut self, id: SectionId, content: impl Into<String>) -> Result<(), DocumentError> {
        let section = self.mutable_section(id)?;
        section.content = content.into();
        Ok(())
    }

    /// Concatenate onto an existing section. Fails if absent.
    pub fn extend(&mut self, id: SectionId, content: &str) -> Result<(), DocumentError> {
        let section = self.mutable_section(id)?;
        concat(&mut section.content, content);
        Ok(())
    }

    /// Concatenate onto a section, creating it with its default title if absent.
    pub fn append_to(&mut self, id: SectionId, content: &str) -> Result<(), DocumentError> {
        if id == SectionId::QueryAnalysis {
            return Err(DocumentError::QueryImmutable);
        }
        match self.sections.get_mut(&id) {
            Some(section) => concat(&mut section.content, content),
            None => {
                self.sections.insert(
                    id,
                    Section {
                        title: id.default_title().to_string(),
                        content: content.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    pub fn get(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(&id)
    }

    pub fn has(&self, id: SectionId) -> bool {
        self.sections.contains_key(&id)
    }

    /// Content of a section, or `""` when absent.
    pub fn content(&self, id: SectionId) -> &str {
        self.sections
            .get(&id)
            .map(|s| s.content.as_str())
            .unwrap_or("")
    }

    /// Remove every section numbered `from` or higher. §0 is never removed.
    pub fn clear_from(&mut self, from: SectionId) {
        let from = from.max(SectionId::GatheredContext);
        self.sections.retain(|id, _| *id < from);
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections.iter().map(|(id, s)| (*id, s))
    }

    pub fn add_source(&mut self, source: SourceRef) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    pub fn add_claim_id(&mut self, id: impl Into<String>) {
        self.claim_ids.push(id.into());
    }

    pub fn claim_ids(&self) -> &[String] {
        &self.claim_ids
    }

    fn mutable_section(&mut self, id: SectionId) -> Result<&mut Section, DocumentError> {
        if id == SectionId::QueryAnalysis {
            return Err(DocumentError::QueryImmutable);
        }
        self.sections
            .get_mut(&id)
            .ok_or(DocumentError::SectionMissing {
                section: id.number(),
            })
    }
}

fn concat(existing: &mut String, content: &str) {
    if !existing.is_empty() {
        existing.push_str(SECTION_SEPARATOR);
    }
    existing.push_str(content);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> WorkingDocument {
        WorkingDocument::new(1, "s1", "u1", "What's my favorite color?", 10)
    }

    #[test]
    fn test_get_query_section_before_anything_else() {
        let d = doc();
        let q = d.get(SectionId::QueryAnalysis).unwrap();
        assert_eq!(q.content, "What's my favorite color?");
        assert_eq!(q.title, "Query Analysis");
        assert!(!d.has(SectionId::GatheredContext));
    }

    #[test]
    fn test_set_query_only_once() {
        let mut d = doc();
        d.set_query("intent: recall").unwrap();
        assert!(d.content(SectionId::QueryAnalysis).contains("intent: recall"));
        assert!(d.content(SectionId::QueryAnalysis).contains("favorite color"));
        assert_eq!(d.set_query("again"), Err(DocumentError::QueryImmutable));
    }

    #[test]
    fn test_query_section_rejects_other_mutations() {
        let mut d = doc();
        assert_eq!(
            d.append(SectionId::QueryAnalysis, None, "x"),
            Err(DocumentError::SectionExists { section: 0 })
        );
        assert_eq!(
            d.update(SectionId::QueryAnalysis, "x"),
            Err(DocumentError::QueryImmutable)
        );
        assert_eq!(
            d.append_to(SectionId::QueryAnalysis, "x"),
            Err(DocumentError::QueryImmutable)
        );
    }

    #[test]
    fn test_append_existing_fails() {
        let mut d = doc();
        d.append(SectionId::Plan, None, "plan v1").unwrap();
        assert_eq!(
            d.append(SectionId::Plan, None, "plan v2"),
            Err(DocumentError::SectionExists { section: 3 })
        );
        assert_eq!(d.content(SectionId::Plan), "plan v1");
    }

    #[test]
    fn test_update_and_extend_missing_fail() {
        let mut d = doc();
        assert_eq!(
            d.update(SectionId::Synthesis, "x"),
            Err(DocumentError::SectionMissing { section: 6 })
        );
        assert_eq!(
            d.extend(SectionId::ToolResults, "x"),
            Err(DocumentError::SectionMissing { section: 5 })
        );
    }

    #[test]
    fn test_update_keeps_title() {
        let mut d = doc();
        d.append(SectionId::Reflection, Some("Custom"), "first").unwrap();
        d.update(SectionId::Reflection, "second").unwrap();
        let s = d.get(SectionId::Reflection).unwrap();
        assert_eq!(s.title, "Custom");
        assert_eq!(s.content, "second");
    }

    #[test]
    fn test_extend_and_append_to_concatenate() {
        let mut d = doc();
        d.append_to(SectionId::GatheredContext, "prior turn").unwrap();
        d.append_to(SectionId::GatheredContext, "memory").unwrap();
        assert_eq!(d.content(SectionId::GatheredContext), "prior turn\n\nmemory");
        d.extend(SectionId::GatheredContext, "more").unwrap();
        assert_eq!(
            d.content(SectionId::GatheredContext),
            "prior turn\n\nmemory\n\nmore"
        );
    }

    #[test]
    fn test_section_numbers_out_of_range_rejected() {
        assert_eq!(
            SectionId::try_from(8),
            Err(DocumentError::InvalidSection { section: 8 })
        );
        assert_eq!(SectionId::try_from(5), Ok(SectionId::ToolResults));
    }

    #[test]
    fn test_clear_from_preserves_prefix() {
        let mut d = doc();
        d.append(SectionId::GatheredContext, None, "ctx").unwrap();
        d.append(SectionId::Reflection, None, "ok").unwrap();
        d.append(SectionId::Plan, None, "plan").unwrap();
        d.append(SectionId::Synthesis, None, "answer").unwrap();
        d.append(SectionId::Validation, None, "RETRY").unwrap();

        d.clear_from(SectionId::Plan);

        let remaining: Vec<u8> = d.sections().map(|(id, _)| id.number()).collect();
        assert_eq!(remaining, vec![0, 1, 2]);
        d.append(SectionId::Plan, None, "plan v2").unwrap();
    }

    #[test]
    fn test_clear_from_never_removes_query() {
        let mut d = doc();
        d.append(SectionId::GatheredContext, None, "ctx").unwrap();
        d.clear_from(SectionId::QueryAnalysis);
        assert!(d.has(SectionId::QueryAnalysis));
        assert!(!d.has(SectionId::GatheredContext));
    }

    #[test]
    fn test_sources_and_claims_append_only() {
        let mut d = doc();
        d.add_source(SourceRef {
            id: "turn:1".into(),
            label: "prior turn".into(),
        });
        d.add_claim_id("c1");
        d.add_claim_id("c2");
        assert_eq!(d.sources().len(), 1);
        assert_eq!(d.claim_ids(), ["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn test_section_id_serde_as_number() {
        let json = serde_json::to_string(&SectionId::Synthesis).unwrap();
        assert_eq!(json, "6");
        let back: SectionId = serde_json::from_str("3").unwrap();
        assert_eq!(back, SectionId::Plan);
        assert!(serde_json::from_str::<SectionId>("9").is_err());
    }
}
