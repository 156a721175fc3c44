//! Phase-strategy boundary.
//!
//! Strategies are external collaborators (typically model-backed). Each gets
//! a read-only [`DocumentView`] and a [`Budget`] and returns raw text; the
//! controller turns that text into a tagged decision with the parsers in
//! [`parse`]. Errors are `anyhow` so implementations can carry whatever
//! context they have.

pub mod decision;
pub mod parse;

pub use decision::*;

use async_trait::async_trait;
use std::sync::Arc;

use crate::document::{Budget, DocumentView};
use crate::pipeline::RetryFailureContext;

#[async_trait]
pub trait QueryAnalyzer: Send + Sync {
    /// `{topic, intent, keywords[], analysis}`
    async fn analyze(&self, view: &DocumentView, budget: Budget) -> anyhow::Result<String>;
}

#[async_trait]
pub trait ContextGatherer: Send + Sync {
    /// Free text, or `{context, sources[]}`.
    async fn gather(&self, view: &DocumentView, budget: Budget) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Reflector: Send + Sync {
    /// `{decision: PROCEED|CLARIFY, reasoning, confidence}`
    async fn reflect(&self, view: &DocumentView, budget: Budget) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// `{goals[], approach, success_criteria, route_to, tools[]}` or the
    /// legacy `{action: EXECUTE|COMPLETE, tools[]}`.
    ///
    /// `retry` carries the claims and sources rejected by earlier attempts.
    async fn plan(
        &self,
        view: &DocumentView,
        budget: Budget,
        retry: Option<&RetryFailureContext>,
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// `{tool_selected, status, result, claims[]}`
    async fn execute(
        &self,
        request: &ToolRequest,
        view: &DocumentView,
        budget: Budget,
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// `{answer}` or `{unanswerable: true, reason}`; plain prose is accepted
    /// as the answer. `hints` are the validator's fixes on a REVISE pass.
    async fn synthesize(
        &self,
        view: &DocumentView,
        budget: Budget,
        hints: &[String],
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// `{decision, confidence, issues[], checks{..}, goal_statuses[],
    /// suggested_fixes[], failed_claims[], failed_sources[], failure_reason}`
    async fn validate(&self, view: &DocumentView, budget: Budget) -> anyhow::Result<String>;
}

/// The full set of strategies a controller drives.
#[derive(Clone)]
pub struct Strategies {
    pub analyzer: Arc<dyn QueryAnalyzer>,
    pub gatherer: Arc<dyn ContextGatherer>,
    pub reflector: Arc<dyn Reflector>,
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn Executor>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub validator: Arc<dyn Validator>,
}
