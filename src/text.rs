//! Keyword extraction and term matching.
//!
//! Used by the index when metadata carries no keywords, by retrieval scoring,
//! and by the controller to derive query terms.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static WORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9_\-']*").expect("valid word regex"));

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "me",
    "my", "no", "not", "of", "on", "or", "our", "please", "she", "so", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "to", "up", "us", "was", "we",
    "were", "what", "whats", "when", "where", "which", "who", "why", "will", "with", "would",
    "you", "your", "tell",
];

/// Normalize a token: lowercase, strip possessive/contraction suffixes.
fn normalize(token: &str) -> String {
    let lower = token.to_lowercase();
    let trimmed = lower
        .strip_suffix("'s")
        .or_else(|| lower.strip_suffix("'re"))
        .unwrap_or(&lower);
    trimmed.trim_matches(|c| c == '\'' || c == '-').to_string()
}

/// Extract the distinct, stop-word-filtered keywords of `text`.
pub fn keywords(text: &str) -> BTreeSet<String> {
    WORD_REGEX
        .find_iter(text)
        .map(|m| normalize(m.as_str()))
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Fraction of `query` terms present in `candidate`, in [0, 1].
pub fn overlap_ratio(query: &BTreeSet<String>, candidate: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let hits = query.intersection(candidate).count();
    hits as f64 / query.len() as f64
}

/// Whether any significant (>= `min_len` chars) query term occurs in `haystack`.
pub fn contains_any_term(query: &BTreeSet<String>, haystack: &str, min_len: usize) -> bool {
    let lower = haystack.to_lowercase();
    query
        .iter()
        .filter(|t| t.len() >= min_len)
        .any(|t| lower.contains(t.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_filters_stop_words() {
        let kws = keywords("What's my favorite color?");
        assert!(kws.contains("favorite"));
        assert!(kws.contains("color"));
        assert!(!kws.contains("my"));
        assert!(!kws.contains("what"));
    }

    #[test]
    fn test_keywords_are_lowercased_and_distinct() {
        let kws = keywords("Rust rust RUST compiler");
        assert_eq!(kws.len(), 2);
        assert!(kws.contains("rust"));
    }

    #[test]
    fn test_overlap_ratio() {
        let q = keywords("favorite color");
        let c = keywords("favorite food blue color");
        assert!((overlap_ratio(&q, &c) - 1.0).abs() < f64::EPSILON);
        let c2 = keywords("weather tomorrow");
        assert_eq!(overlap_ratio(&q, &c2), 0.0);
        assert_eq!(overlap_ratio(&BTreeSet::new(), &c), 0.0);
    }

    #[test]
    fn test_contains_any_term_respects_min_len() {
        let q = keywords("favorite color");
        assert!(contains_any_term(&q, "Your favorite is blue", 4));
        assert!(!contains_any_term(&q, "nothing relevant", 4));
    }
}
