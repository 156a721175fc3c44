//! Relevance scoring for "find relevant prior turns".

/// Weight of keyword overlap in the base score.
pub const KEYWORD_WEIGHT: f64 = 2.0;
/// Weight of topic overlap in the base score.
pub const TOPIC_WEIGHT: f64 = 1.5;
/// Weight of an answer-text match in the base score.
pub const CONTENT_WEIGHT: f64 = 1.0;
/// Maximum recency bonus.
pub const RECENCY_WEIGHT: f64 = 0.5;
/// Recency decay constant, in hours.
pub const RECENCY_DECAY_HOURS: f64 = 24.0;
/// Minimum query-term length for an answer-text match.
pub const CONTENT_MATCH_MIN_LEN: usize = 4;

/// Inputs to [`relevance`] for one candidate turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelevanceSignals {
    /// Fraction of query terms among the turn's keywords.
    pub keyword_overlap: f64,
    /// Fraction of query terms appearing in the turn's topic.
    pub topic_overlap: f64,
    /// Whether a significant query term occurs in the turn's answer.
    pub content_match: bool,
    pub age_hours: f64,
    pub quality: f64,
}

/// Score a candidate. Zero whenever the base (keyword/topic/content) signal
/// is zero, so recency alone never makes a turn relevant.
pub fn relevance(signals: &RelevanceSignals) -> f64 {
    let content = if signals.content_match { 1.0 } else { 0.0 };
    let base = KEYWORD_WEIGHT * signals.keyword_overlap
        + TOPIC_WEIGHT * signals.topic_overlap
        + CONTENT_WEIGHT * content;
    if base <= 0.0 {
        return 0.0;
    }
    let recency = RECENCY_WEIGHT * (-signals.age_hours.max(0.0) / RECENCY_DECAY_HOURS).exp();
    (base + recency) * signals.quality.clamp(0.0, 1.0).sqrt()
}
