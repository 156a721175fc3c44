//! Evidentiary claims extracted from tool results.
//!
//! A claim is live while it is neither invalidated nor past `created_at + ttl`.
//! RETRY invalidates the claims the validator rejected so the next attempt
//! cannot build on them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub content: String,
    pub confidence: f64,
    /// Identifier of the source the claim came from (tool name, URL, turn).
    pub source: String,
    pub ttl_secs: u64,
    pub created_at: DateTime<Utc>,
    pub invalidated: bool,
}

impl Claim {
    pub fn new(
        content: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source: source.into(),
            ttl_secs,
            created_at: Utc::now(),
            invalidated: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        self.created_at
            .checked_add_signed(Duration::seconds(ttl.min(i64::MAX / 1000)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.invalidated && !self.is_expired(now)
    }
}

/// Per-turn claim registry. Insertion order is preserved for rendering.
#[derive(Debug, Default)]
pub struct ClaimStore {
    claims: HashMap<String, Claim>,
    order: Vec<String>,
}

impl ClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a claim and return its id. Re-adding an id replaces the claim in place.
    pub fn add(&mut self, claim: Claim) -> String {
        let id = claim.id.clone();
        if self.claims.insert(id.clone(), claim).is_none() {
            self.order.push(id.clone());
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<&Claim> {
        self.claims.get(id)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Live claims in insertion order.
    pub fn live(&self, now: DateTime<Utc>) -> Vec<&Claim> {
        self.order
            .iter()
            .filter_map(|id| self.claims.get(id))
            .filter(|c| c.is_live(now))
            .collect()
    }

    /// Invalidate the given claims; returns how many were newly invalidated.
    /// Unknown ids are ignored.
    pub fn invalidate<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) -> usize {
        let mut count = 0;
        for id in ids {
            if let Some(claim) = self.claims.get_mut(id)
                && !claim.invalidated
            {
                claim.invalidated = true;
                count += 1;
            }
        }
        count
    }

    /// Invalidate every claim from `source`.
    pub fn invalidate_source(&mut self, source: &str) -> usize {
        let ids = self.ids_for_source(source);
        self.invalidate(ids.iter())
    }

    pub fn ids_for_source(&self, source: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.claims.get(*id).is_some_and(|c| c.source == source))
            .cloned()
            .collect()
    }

    /// Drop expired claims; returns the number removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, c| !c.is_expired(now));
        let claims = &self.claims;
        self.order.retain(|id| claims.contains_key(id));
        before - self.claims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(id: &str, source: &str, ttl: u64) -> Claim {
        Claim::new(format!("content of {}", id), 0.8, source, ttl).with_id(id)
    }

    #[test]
    fn test_add_and_get() {
        let mut store = ClaimStore::new();
        let id = store.add(claim("c1", "web", 60));
        assert_eq!(id, "c1");
        assert_eq!(store.get("c1").unwrap().source, "web");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Claim::new("x", 1.7, "s", 1).confidence, 1.0);
        assert_eq!(Claim::new("x", -0.2, "s", 1).confidence, 0.0);
    }

    #[test]
    fn test_invalidate_removes_from_live() {
        let mut store = ClaimStore::new();
        store.add(claim("c1", "web", 60));
        store.add(claim("c2", "web", 60));
        let ids = vec!["c1".to_string(), "unknown".to_string()];
        assert_eq!(store.invalidate(ids.iter()), 1);
        assert_eq!(store.invalidate(ids.iter()), 0);

        let live: Vec<&str> = store.live(Utc::now()).into_iter().map(|c| c.id.as_str()).collect();
        assert_eq!(live, vec!["c2"]);
    }

    #[test]
    fn test_invalidate_source() {
        let mut store = ClaimStore::new();
        store.add(claim("c1", "web", 60));
        store.add(claim("c2", "memory", 60));
        store.add(claim("c3", "web", 60));
        assert_eq!(store.ids_for_source("web"), vec!["c1", "c3"]);
        assert_eq!(store.invalidate_source("web"), 2);
        assert_eq!(store.live(Utc::now()).len(), 1);
    }

    #[test]
    fn test_expired_claims_are_not_live_and_purged() {
        let mut store = ClaimStore::new();
        store.add(claim("fresh", "web", 3600));
        store.add(claim("stale", "web", 10));
        let later = Utc::now() + Duration::seconds(60);

        let live: Vec<&str> = store.live(later).into_iter().map(|c| c.id.as_str()).collect();
        assert_eq!(live, vec!["fresh"]);
        assert_eq!(store.purge_expired(later), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("stale").is_none());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let c = Claim::new("x", 0.5, "s", u64::MAX);
        assert!(c.is_live(Utc::now()));
    }
}
