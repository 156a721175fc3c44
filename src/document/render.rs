//! Markdown rendering and read-only views handed to phase strategies.

use std::fmt::Write as _;

use super::{SectionId, WorkingDocument};
use crate::util::truncate_chars;

/// Number of recent decisions shown in the rendered header.
const HEADER_DECISIONS: usize = 5;

/// Character budget for a strategy invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_chars: usize,
}

impl Budget {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

/// Immutable snapshot of a working document, optionally truncated to "up to §N".
#[derive(Debug, Clone)]
pub struct DocumentView {
    pub turn: u64,
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    pub up_to: SectionId,
    rendered: String,
}

impl DocumentView {
    /// Full rendering of the snapshot.
    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    /// Rendering cut to the budget.
    pub fn within(&self, budget: Budget) -> &str {
        truncate_chars(&self.rendered, budget.max_chars)
    }
}

impl WorkingDocument {
    /// Render the whole document as markdown.
    pub fn render(&self) -> String {
        self.render_up_to(SectionId::Validation)
    }

    /// Render the header and every section numbered `<= up_to`.
    pub fn render_up_to(&self, up_to: SectionId) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Turn {:06}", self.turn);
        let _ = writeln!(out);
        let _ = writeln!(out, "- session: {}", self.session_id);
        let _ = writeln!(out, "- user: {}", self.user_id);
        let _ = writeln!(
            out,
            "- phase: {} (iteration {}/{})",
            self.state.phase, self.state.iteration, self.state.max_iterations
        );
        let _ = writeln!(out, "- consecutive errors: {}", self.state.consecutive_errors);

        let skip = self.state.history_len().saturating_sub(HEADER_DECISIONS);
        let recent: Vec<String> = self
            .state
            .history()
            .skip(skip)
            .map(|d| format!("{}={}", d.phase, d.decision))
            .collect();
        if !recent.is_empty() {
            let _ = writeln!(out, "- decisions: {}", recent.join(", "));
        }
        if !self.sources().is_empty() {
            let ids: Vec<&str> = self.sources().iter().map(|s| s.id.as_str()).collect();
            let _ = writeln!(out, "- sources: {}", ids.join(", "));
        }

        for (id, section) in self.sections().filter(|(id, _)| *id <= up_to) {
            let _ = writeln!(out);
            let _ = writeln!(out, "## {} {}", id, section.title);
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", section.content.trim_end());
        }
        out
    }

    /// Snapshot for a strategy.
    pub fn view(&self, up_to: SectionId) -> DocumentView {
        DocumentView {
            turn: self.turn,
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            query: self.query().to_string(),
            up_to,
            rendered: self.render_up_to(up_to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PhaseKind;

    fn populated() -> WorkingDocument {
        let mut d = WorkingDocument::new(42, "s1", "u1", "favorite color?", 10);
        d.append(SectionId::GatheredContext, None, "Turn 1: blue").unwrap();
        d.append(SectionId::Plan, None, "answer from memory").unwrap();
        d.append(SectionId::Synthesis, None, "Your favorite color is blue.")
            .unwrap();
        d
    }

    #[test]
    fn test_render_includes_header_and_sections() {
        let mut d = populated();
        d.state.record_decision(PhaseKind::Reflect, "PROCEED", "");
        let out = d.render();
        assert!(out.starts_with("# Turn 000042"));
        assert!(out.contains("- session: s1"));
        assert!(out.contains("reflect=PROCEED"));
        assert!(out.contains("## §0 Query Analysis"));
        assert!(out.contains("## §6 Synthesis"));
    }

    #[test]
    fn test_render_up_to_omits_later_sections() {
        let d = populated();
        let out = d.render_up_to(SectionId::Reflection);
        assert!(out.contains("# Turn 000042"));
        assert!(out.contains("## §1 Gathered Context"));
        assert!(!out.contains("## §3 Plan"));
        assert!(!out.contains("blue."));
    }

    #[test]
    fn test_view_respects_budget() {
        let d = populated();
        let view = d.view(SectionId::Validation);
        assert_eq!(view.query, "favorite color?");
        assert_eq!(view.within(Budget::new(9)), "# Turn 00");
        assert_eq!(view.within(Budget::new(100_000)), view.rendered());
    }
}
