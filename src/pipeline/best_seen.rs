/// A validated candidate answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub answer: String,
    pub confidence: f64,
    /// LOOP pass that produced it (1-based).
    pub attempt: u32,
}

/// Highest-confidence candidate across every validation of a turn.
/// On equal confidence the earliest candidate is kept.
#[derive(Debug, Default)]
pub struct BestSeen {
    best: Option<Candidate>,
}

impl BestSeen {
    pub fn observe(&mut self, candidate: Candidate) {
        let replace = self
            .best
            .as_ref()
            .is_none_or(|b| candidate.confidence > b.confidence);
        if replace {
            self.best = Some(candidate);
        }
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }

    /// The candidate to return when the turn ends without approval: the best
    /// seen if it is strictly more confident than `last`, otherwise `last`.
    pub fn resolve(&self, last: Candidate) -> Candidate {
        match &self.best {
            Some(best) if best.confidence > last.confidence => best.clone(),
            _ => last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(answer: &str, confidence: f64, attempt: u32) -> Candidate {
        Candidate {
            answer: answer.to_string(),
            confidence,
            attempt,
        }
    }

    #[test]
    fn test_keeps_highest_confidence() {
        let mut best = BestSeen::default();
        best.observe(c("first", 0.4, 1));
        best.observe(c("second", 0.9, 2));
        best.observe(c("third", 0.3, 3));
        assert_eq!(best.best().unwrap().answer, "second");
        assert_eq!(best.resolve(c("third", 0.3, 3)).answer, "second");
    }

    #[test]
    fn test_tie_keeps_earliest() {
        let mut best = BestSeen::default();
        best.observe(c("early", 0.6, 1));
        best.observe(c("late", 0.6, 2));
        assert_eq!(best.best().unwrap().answer, "early");
        // Equal confidence is not strictly higher: the final candidate stands.
        assert_eq!(best.resolve(c("late", 0.6, 2)).answer, "late");
    }

    #[test]
    fn test_resolve_without_observations() {
        let best = BestSeen::default();
        assert_eq!(best.resolve(c("only", 0.1, 1)).answer, "only");
    }
}
