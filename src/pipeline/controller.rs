//! The turn controller.
//!
//! One call to [`PipelineController::run_turn`] drives a query through
//! analysis, context gathering, reflection, the plan/execute loop and the
//! synthesize/validate cycle, then persists the result. The controller owns
//! every retry and revision decision; strategies only ever return raw text.
//!
//! Only failures of the authoritative turn store abort a turn. Strategy,
//! tool, validation and index problems are logged and recovered here.

use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;

use super::best_seen::{BestSeen, Candidate};
use super::guard::{
    Unanswerable, approval_override, classify_unanswerable, could_not_find_message,
    partial_message, sanitize_answer,
};
use super::retry::RetryFailureContext;
use super::tools::{ToolCoordinator, ToolLedger};
use crate::approval::PermissionGate;
use crate::claims::{Claim, ClaimStore};
use crate::config::TurnflowConfig;
use crate::document::{Budget, PhaseKind, SectionId, SourceRef, WorkingDocument};
use crate::errors::{DocumentError, PipelineError};
use crate::index::{IndexHandle, IndexScope, TurnIndex};
use crate::store::allocator::{FileLockAllocator, InProcessAllocator, TurnAllocator};
use crate::store::{TurnMetadata, TurnOutcome, TurnRecord, TurnStore, validate_id};
use crate::strategy::parse::{
    parse_gathered_context, parse_plan, parse_query_analysis, parse_reflection, parse_synthesis,
    parse_validation,
};
use crate::strategy::{
    FailureReason, Plan, PlanDecision, ReflectionDecision, Strategies, SynthesisDecision,
    ToolRequest, ToolStatus, ValidationReport, ValidatorDecision, clamp_confidence,
};
use crate::text;
use crate::util::truncate_chars;

/// Quality multiplier applied to a prior turn a retry rejected as a source.
const SUPERSEDED_DEGRADE_FACTOR: f64 = 0.5;

/// Longest tool result copied into §5.
const TOOL_RESULT_MAX_CHARS: usize = 4_000;

const DEFAULT_CLARIFICATION: &str = "Could you say a bit more about what you're looking for?";

/// What the caller gets back from one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub turn: u64,
    pub session_id: String,
    /// Finished answer, clarification question or fallback message.
    pub answer: String,
    pub outcome: TurnOutcome,
    pub confidence: f64,
    /// LOOP passes run (0 when the turn ended at reflection).
    pub attempts: u32,
    pub revisions: u32,
    pub failure_reason: Option<FailureReason>,
    pub issues: Vec<String>,
}

/// Quality score stored for a finished turn.
pub fn quality_score(outcome: TurnOutcome, confidence: f64) -> f64 {
    let confidence = clamp_confidence(confidence);
    match outcome {
        TurnOutcome::Approve => confidence,
        TurnOutcome::ApprovePartial => confidence * 0.8,
        TurnOutcome::Clarify => 0.5,
        TurnOutcome::Revise | TurnOutcome::Retry | TurnOutcome::Fail => (confidence * 0.3).min(0.3),
    }
}

/// Mutable state of one turn.
struct TurnRun {
    doc: WorkingDocument,
    claims: ClaimStore,
    ledger: ToolLedger,
    retry: RetryFailureContext,
    best: BestSeen,
    topic: String,
    intent: String,
    keywords: Vec<String>,
    strategy_summary: String,
    passes: u32,
    revisions: u32,
    issues: Vec<String>,
}

/// How a turn ends, before sanitizing and saving.
struct Finish {
    answer: String,
    outcome: TurnOutcome,
    confidence: f64,
    failure_reason: Option<FailureReason>,
}

impl Finish {
    fn clarify(question: String, confidence: f64) -> Self {
        let question = if question.trim().is_empty() {
            DEFAULT_CLARIFICATION.to_string()
        } else {
            question
        };
        Self {
            answer: question,
            outcome: TurnOutcome::Clarify,
            confidence,
            failure_reason: None,
        }
    }
}

enum LoopExit {
    Synthesize,
    Clarify(String),
}

enum CycleEnd {
    Done(Finish),
    Retry {
        report: ValidationReport,
        candidate: Candidate,
    },
}

pub struct PipelineController {
    config: TurnflowConfig,
    store: Arc<TurnStore>,
    index: IndexHandle,
    allocator: Arc<dyn TurnAllocator>,
    gate: Arc<PermissionGate>,
    strategies: Strategies,
    coordinator: ToolCoordinator,
}

impl PipelineController {
    pub fn new(
        config: TurnflowConfig,
        store: Arc<TurnStore>,
        index: IndexHandle,
        allocator: Arc<dyn TurnAllocator>,
        gate: Arc<PermissionGate>,
        strategies: Strategies,
    ) -> Self {
        let coordinator = ToolCoordinator::new(
            Arc::clone(&strategies.executor),
            Arc::clone(&gate),
            config.tools.clone(),
        );
        Self {
            config,
            store,
            index,
            allocator,
            gate,
            strategies,
            coordinator,
        }
    }

    /// Wire a controller from configuration: open the store and index under
    /// the data directory, reconcile the index against the store and pick the
    /// allocator.
    pub fn from_config(config: TurnflowConfig, strategies: Strategies) -> anyhow::Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "));
        }

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let store = TurnStore::new(data_dir.clone());
        let index_path = config.index_path();
        let index = TurnIndex::open(&index_path, config.index.quality_floor)
            .with_context(|| format!("Failed to open turn index: {}", index_path.display()))?;
        if let Some(report) = index
            .ensure_consistent(&store, &IndexScope::All)
            .context("Failed to reconcile turn index")?
        {
            tracing::info!(
                indexed = report.indexed,
                skipped = report.skipped,
                "Turn index rebuilt at startup"
            );
        }

        let allocator: Arc<dyn TurnAllocator> = if config.storage.file_lock {
            Arc::new(FileLockAllocator::new(store.clone()))
        } else {
            Arc::new(InProcessAllocator::seeded(&store).context("Failed to seed turn allocator")?)
        };
        let gate = Arc::new(PermissionGate::new(&config.approval));

        Ok(Self::new(
            config,
            Arc::new(store),
            IndexHandle::new(index),
            allocator,
            gate,
            strategies,
        ))
    }

    pub fn config(&self) -> &TurnflowConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TurnStore> {
        &self.store
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// The gate approval UIs resolve requests on.
    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    fn budget(&self) -> Budget {
        Budget::new(self.config.pipeline.view_budget_chars)
    }

    /// Run one turn end to end.
    pub async fn run_turn(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
    ) -> Result<TurnResult, PipelineError> {
        validate_id(user_id)?;
        let turn = self.allocator.allocate()?;
        tracing::info!(turn, session_id, user_id, "Turn started");

        let mut run = TurnRun {
            doc: WorkingDocument::new(
                turn,
                session_id,
                user_id,
                query,
                self.config.pipeline.decision_history_cap,
            ),
            claims: ClaimStore::new(),
            ledger: ToolLedger::default(),
            retry: RetryFailureContext::default(),
            best: BestSeen::default(),
            topic: String::new(),
            intent: String::new(),
            keywords: Vec::new(),
            strategy_summary: String::new(),
            passes: 0,
            revisions: 0,
            issues: Vec::new(),
        };

        self.analyze(&mut run).await?;
        self.gather(&mut run).await?;
        if let Some(finish) = self.reflect(&mut run).await? {
            return self.finish(run, finish).await;
        }
        let finish = self.run_loop(&mut run).await?;
        self.finish(run, finish).await
    }

    async fn analyze(&self, run: &mut TurnRun) -> Result<(), PipelineError> {
        run.doc.state.enter_phase(PhaseKind::Analyze, 1);
        let view = run.doc.view(SectionId::QueryAnalysis);
        let result = self.strategies.analyzer.analyze(&view, self.budget()).await;
        let analysis = parse_query_analysis(&strategy_text(run.doc.turn, PhaseKind::Analyze, result));

        let mut keywords: Vec<String> = analysis
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            keywords = text::keywords(run.doc.query()).into_iter().collect();
        }
        let topic = if analysis.topic.is_empty() {
            keywords.iter().take(3).cloned().collect::<Vec<_>>().join(" ")
        } else {
            analysis.topic.clone()
        };

        let mut body = format!(
            "**Topic:** {}\n**Intent:** {}\n**Keywords:** {}",
            topic,
            if analysis.intent.is_empty() { "unknown" } else { &analysis.intent },
            keywords.join(", ")
        );
        if !analysis.analysis.is_empty() {
            body.push_str("\n\n");
            body.push_str(&analysis.analysis);
        }
        run.doc.set_query(body)?;
        run.doc
            .state
            .record_decision(PhaseKind::Analyze, "ANALYZED", topic.clone());

        run.topic = topic;
        run.intent = analysis.intent;
        run.keywords = keywords;
        Ok(())
    }

    async fn gather(&self, run: &mut TurnRun) -> Result<(), PipelineError> {
        run.doc.state.enter_phase(PhaseKind::Gather, 1);
        let turn = run.doc.turn;

        let store = Arc::clone(&self.store);
        let user_id = run.doc.user_id.clone();
        let query = run.doc.query().to_string();
        let limit = self.config.pipeline.relevant_turns;
        let relevant = self
            .index
            .call(move |index| index.find_relevant(&store, &user_id, &query, Utc::now(), limit))
            .await;
        match relevant {
            Ok(relevant) => {
                for prior in relevant {
                    let meta = &prior.metadata;
                    let entry = format!(
                        "### Prior turn {} (relevance {:.2})\n**Topic:** {}\n\n{}",
                        meta.turn_number,
                        prior.score,
                        meta.topic,
                        prior.answer.trim()
                    );
                    run.doc.append_to(SectionId::GatheredContext, &entry)?;
                    run.doc.add_source(SourceRef {
                        id: format!("turn:{}", meta.turn_number),
                        label: meta.topic.clone(),
                    });
                }
            }
            Err(e) => {
                tracing::warn!(turn, error = %e, "Prior-turn retrieval failed, continuing without it");
            }
        }

        let view = run.doc.view(SectionId::GatheredContext);
        let result = self.strategies.gatherer.gather(&view, self.budget()).await;
        let gathered = parse_gathered_context(&strategy_text(turn, PhaseKind::Gather, result));
        if !gathered.context.is_empty() {
            run.doc.append_to(SectionId::GatheredContext, &gathered.context)?;
        }
        for source in gathered.sources {
            add_source_once(&mut run.doc, &source);
        }
        if !run.doc.has(SectionId::GatheredContext) {
            run.doc
                .append(SectionId::GatheredContext, None, "_No context gathered._")?;
        }
        run.doc.state.record_decision(
            PhaseKind::Gather,
            "GATHERED",
            format!("{} sources", run.doc.sources().len()),
        );
        Ok(())
    }

    /// `Some` when the turn ends here with a clarification.
    async fn reflect(&self, run: &mut TurnRun) -> Result<Option<Finish>, PipelineError> {
        run.doc.state.enter_phase(PhaseKind::Reflect, 1);
        let view = run.doc.view(SectionId::GatheredContext);
        let result = self.strategies.reflector.reflect(&view, self.budget()).await;
        let decision = parse_reflection(&strategy_text(run.doc.turn, PhaseKind::Reflect, result));

        let (content, finish) = match &decision {
            ReflectionDecision::Proceed {
                reasoning,
                confidence,
            } => (
                format!("**Decision:** PROCEED ({:.2})\n\n{}", confidence, reasoning),
                None,
            ),
            ReflectionDecision::Clarify {
                question,
                confidence,
            } => (
                format!("**Decision:** CLARIFY ({:.2})\n\n{}", confidence, question),
                Some(Finish::clarify(question.clone(), *confidence)),
            ),
            ReflectionDecision::Unparseable { raw } => {
                tracing::warn!(
                    turn = run.doc.turn,
                    raw = %truncate_chars(raw, 200),
                    "Unparseable reflection, proceeding"
                );
                ("**Decision:** PROCEED (default)".to_string(), None)
            }
        };
        run.doc.append(SectionId::Reflection, None, content)?;
        let label = if matches!(decision, ReflectionDecision::Unparseable { .. }) {
            "PROCEED"
        } else {
            decision.label()
        };
        run.doc
            .state
            .record_decision(PhaseKind::Reflect, label, String::new());
        Ok(finish)
    }

    /// The Plan→Execute→Synthesize→Validate supercycle, bounded by
    /// `max_retries` total passes.
    async fn run_loop(&self, run: &mut TurnRun) -> Result<Finish, PipelineError> {
        let max_passes = self.config.pipeline.max_retries.max(1);
        loop {
            run.passes += 1;
            let turn = run.doc.turn;
            tracing::info!(turn, attempt = run.passes, max_passes, "Starting plan/execute pass");

            if let LoopExit::Clarify(question) = self.plan_and_execute(run).await? {
                return Ok(Finish::clarify(question, 0.5));
            }

            match self.synthesize_and_validate(run).await? {
                CycleEnd::Done(finish) => return Ok(finish),
                CycleEnd::Retry { report, candidate } => {
                    if run.passes >= max_passes {
                        tracing::warn!(turn, attempt = run.passes, "Retry budget exhausted");
                        run.retry.merge(&report);
                        let reason = report.failure_reason.or(run.retry.reason);
                        return Ok(fail_with_best(run, candidate, reason));
                    }
                    self.prepare_retry(run, &report, &candidate.answer).await?;
                }
            }
        }
    }

    async fn plan_and_execute(&self, run: &mut TurnRun) -> Result<LoopExit, PipelineError> {
        let max_iterations = self.config.pipeline.max_plan_iterations.max(1);
        let turn = run.doc.turn;

        for iteration in 1..=max_iterations {
            run.doc
                .state
                .enter_phase_at(PhaseKind::Plan, iteration, max_iterations);
            let view = run.doc.view(SectionId::ToolResults);
            let retry = (!run.retry.is_empty()).then_some(&run.retry);
            let result = self
                .strategies
                .planner
                .plan(&view, self.budget(), retry)
                .await;
            let decision = parse_plan(&strategy_text(turn, PhaseKind::Plan, result));

            if let Some(plan) = decision.plan() {
                let section = render_plan(plan, iteration, retry);
                run.doc.append_to(SectionId::Plan, &section)?;
                if !plan.approach.is_empty() {
                    run.strategy_summary = plan.approach.clone();
                } else if !plan.goals.is_empty() {
                    run.strategy_summary = plan.goals.join("; ");
                }
            }
            run.doc.state.record_decision(
                PhaseKind::Plan,
                decision.label(),
                format!("iteration {}", iteration),
            );

            match decision {
                PlanDecision::Unparseable { raw } => {
                    tracing::warn!(
                        turn,
                        iteration,
                        raw = %truncate_chars(&raw, 200),
                        "Unparseable plan, moving to synthesis"
                    );
                    return Ok(LoopExit::Synthesize);
                }
                PlanDecision::Synthesize(_) => return Ok(LoopExit::Synthesize),
                PlanDecision::Clarify { question, .. } => return Ok(LoopExit::Clarify(question)),
                PlanDecision::Execute(plan) => {
                    if run.ledger.limit_reached(&self.config.tools) {
                        tracing::info!(turn, iteration, "Tool limits reached, ignoring EXECUTE");
                        return Ok(LoopExit::Synthesize);
                    }
                    if plan.tools.is_empty() {
                        return Ok(LoopExit::Synthesize);
                    }
                    if self.execute_tools(run, plan.tools).await? {
                        return Ok(LoopExit::Synthesize);
                    }
                }
            }
        }
        tracing::debug!(turn, "Planner iterations exhausted");
        Ok(LoopExit::Synthesize)
    }

    /// Run one batch and write §4/§5. Returns whether a hard limit was hit.
    async fn execute_tools(
        &self,
        run: &mut TurnRun,
        requests: Vec<ToolRequest>,
    ) -> Result<bool, PipelineError> {
        run.doc.state.enter_phase(PhaseKind::Execute, 1);
        let view = run.doc.view(SectionId::Plan);
        let batch = self
            .coordinator
            .run_batch(&run.doc.session_id, requests, &view, self.budget(), &mut run.ledger)
            .await;

        let mut log = Vec::new();
        for outcome in &batch.executed {
            let report = &outcome.report;
            let mut line = format!(
                "- `{}` {} ({} ms)",
                outcome.request.tool, report.status, outcome.elapsed_ms
            );
            if outcome.timed_out {
                line.push_str(", timed out");
            }
            if outcome.retried {
                line.push_str(", retried after intervention");
            }
            log.push(line);

            if report.status == ToolStatus::Error {
                run.doc.state.record_error();
            } else {
                run.doc.state.reset_errors();
            }

            let mut results = format!(
                "### {}\n{}",
                report.tool_selected,
                truncate_chars(&report.result, TOOL_RESULT_MAX_CHARS)
            );
            for draft in &report.claims {
                let source = if draft.source.is_empty() {
                    report.tool_selected.clone()
                } else {
                    draft.source.clone()
                };
                if run.retry.skips_source(&source) {
                    tracing::debug!(turn = run.doc.turn, %source, "Dropping claim from rejected source");
                    continue;
                }
                let id = run.claims.add(Claim::new(
                    draft.content.clone(),
                    draft.confidence,
                    source.clone(),
                    self.config.claims.ttl_secs,
                ));
                results.push_str(&format!(
                    "\n- claim `{}` ({:.2}, {}): {}",
                    id, draft.confidence, source, draft.content
                ));
                add_source_once(&mut run.doc, &source);
                run.doc.add_claim_id(id);
            }
            run.doc.append_to(SectionId::ToolResults, &results)?;
        }
        for (request, reason) in &batch.skipped {
            log.push(format!("- `{}` skipped ({:?})", request.tool, reason));
        }
        if !log.is_empty() {
            run.doc.append_to(SectionId::Execution, &log.join("\n"))?;
        }

        run.doc.state.record_decision(
            PhaseKind::Execute,
            "EXECUTED",
            format!(
                "{} run, {} skipped, {} total",
                batch.executed.len(),
                batch.skipped.len(),
                run.ledger.total_calls
            ),
        );
        Ok(batch.limit_reached)
    }

    /// Synthesize, validate and revise until a terminal decision or a RETRY.
    async fn synthesize_and_validate(&self, run: &mut TurnRun) -> Result<CycleEnd, PipelineError> {
        let turn = run.doc.turn;
        let threshold = self.config.pipeline.approve_confidence_threshold;
        let max_revisions = self.config.pipeline.max_revisions;
        let mut hints: Vec<String> = Vec::new();

        loop {
            let round = run.revisions + 1;
            run.doc
                .state
                .enter_phase_at(PhaseKind::Synthesize, round, max_revisions + 1);
            let view = run.doc.view(SectionId::ToolResults);
            let result = self
                .strategies
                .synthesizer
                .synthesize(&view, self.budget(), &hints)
                .await;
            let answer = match parse_synthesis(&strategy_text(turn, PhaseKind::Synthesize, result)) {
                SynthesisDecision::Answer { answer } => answer,
                SynthesisDecision::Unanswerable { reason } => {
                    put_section(
                        &mut run.doc,
                        SectionId::Synthesis,
                        format!("**Unanswerable:** {}", reason),
                    )?;
                    run.doc
                        .state
                        .record_decision(PhaseKind::Synthesize, "UNANSWERABLE", reason.clone());
                    return Ok(self.unanswerable(run, reason));
                }
                SynthesisDecision::Unparseable { raw } => {
                    tracing::warn!(
                        turn,
                        raw = %truncate_chars(&raw, 200),
                        "Unparseable synthesis, treating as retry"
                    );
                    put_section(&mut run.doc, SectionId::Synthesis, "_No usable answer._")?;
                    let report = ValidationReport {
                        issues: vec!["synthesizer returned no usable answer".to_string()],
                        ..Default::default()
                    };
                    return Ok(CycleEnd::Retry {
                        report,
                        candidate: empty_candidate(run.passes),
                    });
                }
            };
            put_section(&mut run.doc, SectionId::Synthesis, answer.clone())?;
            run.doc
                .state
                .record_decision(PhaseKind::Synthesize, "ANSWERED", format!("revision {}", run.revisions));

            run.doc
                .state
                .enter_phase_at(PhaseKind::Validate, round, max_revisions + 1);
            let view = run.doc.view(SectionId::Synthesis);
            let result = self.strategies.validator.validate(&view, self.budget()).await;
            let decision = parse_validation(&strategy_text(turn, PhaseKind::Validate, result));
            let confidence = decision.confidence();
            let candidate = Candidate {
                answer,
                confidence,
                attempt: run.passes,
            };
            run.best.observe(candidate.clone());

            put_section(&mut run.doc, SectionId::Validation, render_validation(&decision))?;
            run.doc.state.record_decision(
                PhaseKind::Validate,
                decision.label(),
                format!("confidence {:.2}", confidence),
            );
            tracing::info!(
                turn,
                attempt = run.passes,
                decision = decision.label(),
                confidence,
                "Validation decision"
            );

            match decision {
                ValidatorDecision::Unparseable { raw } => {
                    tracing::warn!(
                        turn,
                        raw = %truncate_chars(&raw, 200),
                        "Unparseable validation, failing turn"
                    );
                    return Ok(CycleEnd::Done(fail_with_best(run, candidate, None)));
                }
                ValidatorDecision::Fail(report) => {
                    run.issues.extend(report.issues.iter().cloned());
                    return Ok(CycleEnd::Done(fail_with_best(run, candidate, report.failure_reason)));
                }
                ValidatorDecision::Retry(report) => {
                    return Ok(CycleEnd::Retry { report, candidate });
                }
                ValidatorDecision::Approve(report) => {
                    return Ok(self.on_approval(run, report, candidate, false));
                }
                ValidatorDecision::ApprovePartial(report) => {
                    return Ok(self.on_approval(run, report, candidate, true));
                }
                ValidatorDecision::Revise(report) => {
                    if run.revisions < max_revisions {
                        run.revisions += 1;
                        tracing::info!(turn, revision = run.revisions, "Revising answer");
                        hints = report
                            .suggested_fixes
                            .iter()
                            .chain(report.issues.iter())
                            .cloned()
                            .collect();
                        continue;
                    }
                    tracing::info!(turn, confidence, "Revision budget exhausted");
                    run.issues.extend(report.issues.iter().cloned());
                    if confidence >= threshold {
                        return Ok(CycleEnd::Done(approved(candidate, &report, true)));
                    }
                    return Ok(CycleEnd::Done(fail_with_best(run, candidate, report.failure_reason)));
                }
            }
        }
    }

    /// Apply the false-approval guard. Overrides fire only while retry
    /// budget remains; afterwards they are recorded as issues.
    fn on_approval(
        &self,
        run: &mut TurnRun,
        mut report: ValidationReport,
        candidate: Candidate,
        partial: bool,
    ) -> CycleEnd {
        let threshold = self.config.pipeline.approve_confidence_threshold;
        let max_passes = self.config.pipeline.max_retries.max(1);
        let turn = run.doc.turn;

        if let Some((reason, why)) = approval_override(&report, threshold) {
            if run.passes < max_passes {
                tracing::warn!(turn, attempt = run.passes, %reason, "Overriding approval into RETRY");
                run.doc.state.record_decision(
                    PhaseKind::Validate,
                    "RETRY",
                    format!("override: {}", reason),
                );
                report.failure_reason = Some(reason);
                report.issues.push(why);
                return CycleEnd::Retry { report, candidate };
            }
            tracing::info!(turn, %reason, "Approval override suppressed, retry budget exhausted");
            run.issues
                .push(format!("{} (not retried: retry budget exhausted)", why));
        }
        run.issues.extend(report.issues.iter().cloned());
        CycleEnd::Done(approved(candidate, &report, partial))
    }

    fn unanswerable(&self, run: &mut TurnRun, reason: String) -> CycleEnd {
        match classify_unanswerable(&reason, &run.ledger) {
            Unanswerable::CouldNotFind => {
                tracing::info!(turn = run.doc.turn, %reason, "Research exhausted, answering could-not-find");
                CycleEnd::Done(Finish {
                    answer: could_not_find_message(run.doc.query(), &reason),
                    outcome: TurnOutcome::Fail,
                    confidence: 0.0,
                    failure_reason: Some(FailureReason::SynthesisUnanswerable),
                })
            }
            Unanswerable::Retry => {
                tracing::info!(turn = run.doc.turn, %reason, "Synthesizer could not answer, retrying");
                let report = ValidationReport {
                    issues: vec![format!("synthesizer could not answer: {}", reason)],
                    failure_reason: Some(FailureReason::SynthesisUnanswerable),
                    ..Default::default()
                };
                CycleEnd::Retry {
                    report,
                    candidate: empty_candidate(run.passes),
                }
            }
        }
    }

    /// Archive the rejected attempt, fold its skip list in, invalidate its
    /// claims, degrade rejected prior turns and clear §3..§7.
    async fn prepare_retry(
        &self,
        run: &mut TurnRun,
        report: &ValidationReport,
        answer: &str,
    ) -> Result<(), PipelineError> {
        let turn = run.doc.turn;
        let attempt = run.passes;
        self.store
            .archive_attempt(&run.doc.user_id, turn, attempt, &run.doc.render(), answer)?;

        run.retry.merge(report);
        let mut invalidated = run.claims.invalidate(run.retry.failed_claims.iter());
        for source in &run.retry.failed_sources {
            invalidated += run.claims.invalidate_source(source);
        }
        run.claims.purge_expired(Utc::now());

        for source in &report.failed_sources {
            let Some(prior) = source
                .strip_prefix("turn:")
                .and_then(|n| n.trim().parse::<u64>().ok())
            else {
                continue;
            };
            if prior == turn {
                continue;
            }
            let store = Arc::clone(&self.store);
            let reason = format!(
                "rejected as a source by turn {}: {}",
                turn,
                report
                    .failure_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "retry".to_string())
            );
            let degraded = self
                .index
                .call(move |index| {
                    index.degrade_and_persist(&store, prior, SUPERSEDED_DEGRADE_FACTOR, &reason, Some(turn))
                })
                .await;
            match degraded {
                Ok(score) => tracing::info!(turn, prior, score, "Degraded prior turn"),
                Err(e) => tracing::warn!(turn, prior, error = %e, "Failed to degrade prior turn"),
            }
        }

        run.doc.clear_from(SectionId::Plan);
        run.doc.state.record_decision(
            PhaseKind::Validate,
            "RETRY",
            run.retry
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| format!("attempt {}", attempt)),
        );
        tracing::info!(
            turn,
            attempt,
            invalidated,
            live_claims = run.claims.live(Utc::now()).len(),
            skipped_sources = run.retry.failed_sources.len(),
            "Retrying turn"
        );
        Ok(())
    }

    /// Sanitize, persist and index the finished turn.
    async fn finish(&self, mut run: TurnRun, finish: Finish) -> Result<TurnResult, PipelineError> {
        let turn = run.doc.turn;
        run.doc.state.enter_phase(PhaseKind::Save, 1);

        let answer = sanitize_answer(&finish.answer);
        if answer != finish.answer.trim() {
            tracing::warn!(turn, "Replaced internal payload with fallback answer");
        }
        let quality = quality_score(finish.outcome, finish.confidence);
        run.doc.state.record_decision(
            PhaseKind::Save,
            finish.outcome.as_str(),
            format!("quality {:.2}", quality),
        );

        let metadata = TurnMetadata {
            turn_number: turn,
            user_id: run.doc.user_id.clone(),
            session_id: run.doc.session_id.clone(),
            timestamp: Utc::now(),
            topic: run.topic,
            intent: run.intent,
            keywords: run.keywords,
            validation_outcome: finish.outcome,
            quality_score: quality,
            strategy_summary: run.strategy_summary,
            feedback_status: None,
            feedback_confidence: None,
            superseded_by: None,
            degrade_reason: None,
        };
        let record = TurnRecord {
            metadata: metadata.clone(),
            document: run.doc.render(),
            answer: answer.clone(),
        };
        self.store.save_turn(&record)?;

        let indexed_answer = answer.clone();
        if let Err(e) = self
            .index
            .call(move |index| index.upsert_with_answer(&metadata, &indexed_answer))
            .await
        {
            tracing::warn!(turn, error = %e, "Index upsert failed, reconciliation will repair it");
        }

        tracing::info!(
            turn,
            outcome = %finish.outcome,
            confidence = finish.confidence,
            quality,
            attempts = run.passes,
            revisions = run.revisions,
            "Turn finished"
        );
        Ok(TurnResult {
            turn,
            session_id: run.doc.session_id,
            answer,
            outcome: finish.outcome,
            confidence: finish.confidence,
            attempts: run.passes,
            revisions: run.revisions,
            failure_reason: finish.failure_reason,
            issues: run.issues,
        })
    }
}

/// Raw strategy output, or `""` (which every parser maps to its fallback)
/// when the strategy itself failed.
fn strategy_text(turn: u64, phase: PhaseKind, result: anyhow::Result<String>) -> String {
    match result {
        Ok(raw) => raw,
        Err(e) => {
            let error = format!("{:#}", e);
            tracing::warn!(turn, %phase, %error, "Strategy failed");
            String::new()
        }
    }
}

fn empty_candidate(attempt: u32) -> Candidate {
    Candidate {
        answer: String::new(),
        confidence: 0.0,
        attempt,
    }
}

fn fail_with_best(run: &TurnRun, last: Candidate, reason: Option<FailureReason>) -> Finish {
    let last_attempt = last.attempt;
    let chosen = run.best.resolve(last);
    if chosen.attempt != last_attempt {
        tracing::info!(
            turn = run.doc.turn,
            attempt = chosen.attempt,
            confidence = chosen.confidence,
            "Returning best-seen candidate"
        );
    }
    Finish {
        answer: chosen.answer,
        outcome: TurnOutcome::Fail,
        confidence: chosen.confidence,
        failure_reason: reason.or(run.retry.reason),
    }
}

fn approved(candidate: Candidate, report: &ValidationReport, partial: bool) -> Finish {
    let mut answer = candidate.answer;
    if partial && let Some(note) = partial_message(&report.goal_statuses) {
        answer = format!("{}\n\n{}", answer.trim_end(), note);
    }
    Finish {
        answer,
        outcome: if partial {
            TurnOutcome::ApprovePartial
        } else {
            TurnOutcome::Approve
        },
        confidence: candidate.confidence,
        failure_reason: None,
    }
}

/// Create or replace a section.
fn put_section(
    doc: &mut WorkingDocument,
    id: SectionId,
    content: impl Into<String>,
) -> Result<(), DocumentError> {
    if doc.has(id) {
        doc.update(id, content)
    } else {
        doc.append(id, None, content)
    }
}

fn add_source_once(doc: &mut WorkingDocument, id: &str) {
    if !doc.sources().iter().any(|s| s.id == id) {
        doc.add_source(SourceRef {
            id: id.to_string(),
            label: id.to_string(),
        });
    }
}

fn render_plan(plan: &Plan, iteration: u32, retry: Option<&RetryFailureContext>) -> String {
    let mut out = format!("### Iteration {}", iteration);
    if iteration == 1
        && let Some(retry) = retry
    {
        out.push_str("\n\n");
        out.push_str(&retry.summary());
    }
    if !plan.goals.is_empty() {
        out.push_str("\n\n**Goals:**");
        for goal in &plan.goals {
            out.push_str(&format!("\n- {}", goal));
        }
    }
    if !plan.approach.is_empty() {
        out.push_str(&format!("\n\n**Approach:** {}", plan.approach));
    }
    if !plan.success_criteria.is_empty() {
        out.push_str(&format!("\n**Success criteria:** {}", plan.success_criteria));
    }
    if !plan.tools.is_empty() {
        let tools: Vec<&str> = plan.tools.iter().map(|t| t.tool.as_str()).collect();
        out.push_str(&format!("\n**Tools:** {}", tools.join(", ")));
    }
    out
}

fn render_validation(decision: &ValidatorDecision) -> String {
    let mut out = format!(
        "**Decision:** {} (confidence {:.2})",
        decision.label(),
        decision.confidence()
    );
    let Some(report) = decision.report() else {
        return out;
    };
    if let Some(reason) = report.failure_reason {
        out.push_str(&format!("\n**Failure reason:** {}", reason));
    }
    if !report.checks.all_pass() {
        out.push_str(&format!(
            "\n**Checks:** query_terms_in_context={}, answer_terms_in_context={}, subject_substitution={}",
            report.checks.query_terms_in_context,
            report.checks.answer_terms_in_context,
            report.checks.subject_substitution
        ));
    }
    for issue in &report.issues {
        out.push_str(&format!("\n- {}", issue));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{GoalStatus, ValidationChecks};

    #[test]
    fn test_quality_score() {
        assert_eq!(quality_score(TurnOutcome::Approve, 0.9), 0.9);
        assert!((quality_score(TurnOutcome::ApprovePartial, 0.9) - 0.72).abs() < 1e-9);
        assert_eq!(quality_score(TurnOutcome::Clarify, 0.1), 0.5);
        assert!((quality_score(TurnOutcome::Fail, 0.5) - 0.15).abs() < 1e-9);
        assert_eq!(quality_score(TurnOutcome::Fail, 2.0), 0.3);
        assert_eq!(quality_score(TurnOutcome::Approve, f64::NAN), 0.0);
    }

    #[test]
    fn test_put_section_creates_then_replaces() {
        let mut doc = WorkingDocument::new(1, "s1", "u1", "q", 10);
        put_section(&mut doc, SectionId::Synthesis, "first").unwrap();
        put_section(&mut doc, SectionId::Synthesis, "second").unwrap();
        assert_eq!(doc.content(SectionId::Synthesis), "second");
    }

    #[test]
    fn test_approved_partial_appends_goal_note() {
        let report = ValidationReport {
            goal_statuses: vec![
                GoalStatus {
                    goal: "name the color".into(),
                    fulfilled: true,
                },
                GoalStatus {
                    goal: "name the shade".into(),
                    fulfilled: false,
                },
            ],
            ..Default::default()
        };
        let finish = approved(
            Candidate {
                answer: "Blue.".into(),
                confidence: 0.8,
                attempt: 1,
            },
            &report,
            true,
        );
        assert_eq!(finish.outcome, TurnOutcome::ApprovePartial);
        assert!(finish.answer.starts_with("Blue.\n\nThis answer is partial."));
        assert!(finish.answer.contains("name the shade"));
    }

    #[test]
    fn test_render_validation_lists_failed_checks() {
        let decision = ValidatorDecision::Retry(ValidationReport {
            confidence: 0.4,
            checks: ValidationChecks {
                subject_substitution: true,
                ..Default::default()
            },
            issues: vec!["wrong person".into()],
            failure_reason: Some(FailureReason::SubjectSubstitution),
            ..Default::default()
        });
        let rendered = render_validation(&decision);
        assert!(rendered.starts_with("**Decision:** RETRY (confidence 0.40)"));
        assert!(rendered.contains("subject_substitution=true"));
        assert!(rendered.contains("- wrong person"));
    }

    #[test]
    fn test_render_plan_includes_retry_summary_on_first_iteration() {
        let plan = Plan {
            goals: vec!["recall the color".into()],
            approach: "check memory".into(),
            success_criteria: String::new(),
            tools: vec![ToolRequest::new("memory_recall", "")],
        };
        let mut retry = RetryFailureContext::default();
        retry.merge(&ValidationReport {
            failed_sources: vec!["turn:2".into()],
            ..Default::default()
        });
        let first = render_plan(&plan, 1, Some(&retry));
        assert!(first.contains("turn:2"));
        assert!(first.contains("**Tools:** memory_recall"));
        assert!(!render_plan(&plan, 2, Some(&retry)).contains("turn:2"));
    }
}
