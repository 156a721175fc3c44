//! Concurrent tool execution for one planner iteration.
//!
//! Calls run in parallel under a per-call timeout. A [`ToolLedger`] carries the
//! turn-wide limits: total calls, consecutive failures, permanently failed
//! tools, exhausted tool classes and fingerprints of high-cost calls already
//! issued.

use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::approval::{PermissionGate, PermissionStatus};
use crate::config::ToolsSection;
use crate::document::{Budget, DocumentView};
use crate::strategy::parse::parse_execution;
use crate::strategy::{ExecutionReport, Executor, ToolRequest, ToolStatus};

/// Error text that marks a failure a human must look at.
const CRITICAL_MARKERS: &[&str] = &[
    "unauthorized",
    "authentication",
    "forbidden",
    "permission denied",
    "rate limit",
    "rate-limit",
    "too many requests",
    "401",
    "403",
    "429",
];

/// Turn-wide tool accounting.
#[derive(Debug, Default)]
pub struct ToolLedger {
    pub total_calls: u32,
    pub consecutive_failures: u32,
    pub failed_tools: BTreeSet<String>,
    pub exhausted: BTreeSet<String>,
    issued: HashSet<String>,
}

impl ToolLedger {
    pub fn limit_reached(&self, limits: &ToolsSection) -> bool {
        self.total_calls >= limits.max_tool_calls
            || self.consecutive_failures >= limits.max_consecutive_failures
    }

    pub fn is_blocked(&self, tool: &str) -> bool {
        self.failed_tools.contains(tool) || self.exhausted.contains(tool)
    }

    /// Any research path already ruled out this turn.
    pub fn research_exhausted(&self) -> bool {
        !self.exhausted.is_empty() || !self.failed_tools.is_empty()
    }

    fn record(&mut self, tool: &str, status: ToolStatus) {
        match status {
            ToolStatus::Success => self.consecutive_failures = 0,
            ToolStatus::Empty => {
                self.consecutive_failures = 0;
                self.exhausted.insert(tool.to_string());
            }
            ToolStatus::Error => {
                self.consecutive_failures += 1;
                self.failed_tools.insert(tool.to_string());
            }
        }
    }
}

/// Identity of a call for the duplicate guard: tool, canonical args and
/// normalized instruction.
pub fn fingerprint(request: &ToolRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.tool.as_bytes());
    hasher.update([0u8]);
    // serde_json maps are sorted, so this is canonical.
    hasher.update(request.args.to_string().as_bytes());
    hasher.update([0u8]);
    let instruction = request
        .instruction
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    hasher.update(instruction.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn is_critical_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CRITICAL_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LimitReached,
    Failed,
    Exhausted,
    Duplicate,
    Denied,
}

/// Result of one executed call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub request: ToolRequest,
    pub report: ExecutionReport,
    pub elapsed_ms: u128,
    pub timed_out: bool,
    /// Retried once after a human approved an intervention.
    pub retried: bool,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub executed: Vec<ToolOutcome>,
    pub skipped: Vec<(ToolRequest, SkipReason)>,
    /// A hard limit was hit during or before this batch.
    pub limit_reached: bool,
}

pub struct ToolCoordinator {
    executor: Arc<dyn Executor>,
    gate: Arc<PermissionGate>,
    limits: ToolsSection,
}

impl ToolCoordinator {
    pub fn new(executor: Arc<dyn Executor>, gate: Arc<PermissionGate>, limits: ToolsSection) -> Self {
        Self {
            executor,
            gate,
            limits,
        }
    }

    /// Admit, run and account for one planner iteration's tool requests.
    pub async fn run_batch(
        &self,
        session_id: &str,
        requests: Vec<ToolRequest>,
        view: &DocumentView,
        budget: Budget,
        ledger: &mut ToolLedger,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let admitted = self.admit(session_id, requests, ledger, &mut outcome).await;

        let futures = admitted
            .iter()
            .map(|request| self.execute_one(request, view, budget));
        let results = join_all(futures).await;

        for (request, mut result) in admitted.into_iter().zip(results) {
            if result.report.status == ToolStatus::Error && is_critical_error(&result.report.result) {
                tracing::warn!(tool = %request.tool, error = %result.report.result, "Critical tool error");
                let approved = self
                    .gate
                    .request_intervention(session_id, &request.tool, &result.report.result)
                    .await;
                if approved {
                    ledger.total_calls += 1;
                    let mut retry = self.execute_one(&request, view, budget).await;
                    retry.retried = true;
                    result = retry;
                }
            }
            if result.report.status == ToolStatus::Error {
                tracing::warn!(
                    tool = %request.tool,
                    timed_out = result.timed_out,
                    error = %result.report.result,
                    "Tool call failed"
                );
            }
            ledger.record(&request.tool, result.report.status);
            outcome.executed.push(result);
        }

        outcome.limit_reached = outcome.limit_reached || ledger.limit_reached(&self.limits);
        outcome
    }

    async fn admit(
        &self,
        session_id: &str,
        requests: Vec<ToolRequest>,
        ledger: &mut ToolLedger,
        outcome: &mut BatchOutcome,
    ) -> Vec<ToolRequest> {
        let mut admitted = Vec::new();
        for request in requests {
            if ledger.limit_reached(&self.limits) {
                outcome.limit_reached = true;
                outcome.skipped.push((request, SkipReason::LimitReached));
                continue;
            }
            if ledger.failed_tools.contains(&request.tool) {
                outcome.skipped.push((request, SkipReason::Failed));
                continue;
            }
            if ledger.exhausted.contains(&request.tool) {
                outcome.skipped.push((request, SkipReason::Exhausted));
                continue;
            }
            if self.limits.high_cost_tools.contains(&request.tool)
                && !ledger.issued.insert(fingerprint(&request))
            {
                tracing::debug!(tool = %request.tool, "Skipping duplicate high-cost call");
                outcome.skipped.push((request, SkipReason::Duplicate));
                continue;
            }
            if self.gate.check(session_id, &request).await == PermissionStatus::Denied {
                tracing::info!(tool = %request.tool, "Tool call denied");
                outcome.skipped.push((request, SkipReason::Denied));
                continue;
            }
            ledger.total_calls += 1;
            admitted.push(request);
        }
        admitted
    }

    async fn execute_one(&self, request: &ToolRequest, view: &DocumentView, budget: Budget) -> ToolOutcome {
        let started = Instant::now();
        let call = self.executor.execute(request, view, budget);
        let (report, timed_out) = match tokio::time::timeout(self.limits.call_timeout(), call).await {
            Ok(Ok(raw)) => (parse_execution(&raw, &request.tool), false),
            Ok(Err(e)) => (error_report(request, format!("{:#}", e)), false),
            Err(_) => (
                error_report(
                    request,
                    format!("timed out after {}s", self.limits.call_timeout_secs),
                ),
                true,
            ),
        };
        ToolOutcome {
            request: request.clone(),
            report,
            elapsed_ms: started.elapsed().as_millis(),
            timed_out,
            retried: false,
        }
    }
}

fn error_report(request: &ToolRequest, message: String) -> ExecutionReport {
    ExecutionReport {
        tool_selected: request.tool.clone(),
        status: ToolStatus::Error,
        result: message,
        claims: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApprovalSection;
    use crate::document::{SectionId, WorkingDocument};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Executor whose behavior is keyed by tool name.
    struct ScriptedExecutor {
        calls: AtomicU32,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            request: &ToolRequest,
            _view: &DocumentView,
            _budget: Budget,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.tool.clone());
            match request.tool.as_str() {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok("late".to_string())
                }
                "broken" => anyhow::bail!("connection reset"),
                "locked" => anyhow::bail!("401 Unauthorized"),
                "empty" => Ok(r#"{"status": "empty", "result": ""}"#.to_string()),
                _ => Ok(format!(
                    r#"{{"status": "success", "result": "result of {}", "claims": ["fact"]}}"#,
                    request.tool
                )),
            }
        }
    }

    fn limits() -> ToolsSection {
        ToolsSection {
            max_tool_calls: 4,
            max_consecutive_failures: 2,
            call_timeout_secs: 1,
            high_cost_tools: vec!["web_search".to_string()],
        }
    }

    fn coordinator(executor: Arc<ScriptedExecutor>, timeout_secs: u64) -> ToolCoordinator {
        let gate = Arc::new(PermissionGate::new(&ApprovalSection {
            timeout_secs,
            safe_tools: vec![],
            denied_tools: vec!["shell".to_string()],
        }));
        ToolCoordinator::new(executor, gate, limits())
    }

    fn view() -> DocumentView {
        WorkingDocument::new(1, "s1", "u1", "q", 10).view(SectionId::Validation)
    }

    #[test]
    fn test_fingerprint_normalizes_instruction() {
        let a = ToolRequest::new("web_search", "Find  the   Weather");
        let b = ToolRequest::new("web_search", "find the weather");
        let c = ToolRequest::new("web_search", "find the news");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_critical_error_detection() {
        assert!(is_critical_error("HTTP 429 Too Many Requests"));
        assert!(is_critical_error("Permission denied (publickey)"));
        assert!(!is_critical_error("connection reset"));
    }

    #[tokio::test]
    async fn test_batch_runs_and_records() {
        let executor = ScriptedExecutor::new();
        let coord = coordinator(executor.clone(), 1);
        let mut ledger = ToolLedger::default();
        let batch = coord
            .run_batch(
                "s1",
                vec![ToolRequest::new("memory_recall", ""), ToolRequest::new("empty", "")],
                &view(),
                Budget::new(1000),
                &mut ledger,
            )
            .await;
        assert_eq!(batch.executed.len(), 2);
        assert_eq!(batch.executed[0].report.status, ToolStatus::Success);
        assert_eq!(batch.executed[0].report.claims.len(), 1);
        assert_eq!(ledger.total_calls, 2);
        assert!(ledger.exhausted.contains("empty"));
        assert!(ledger.is_blocked("empty"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_tool_failed() {
        let executor = ScriptedExecutor::new();
        let coord = coordinator(executor.clone(), 1);
        let mut ledger = ToolLedger::default();
        let batch = coord
            .run_batch("s1", vec![ToolRequest::new("slow", "")], &view(), Budget::new(10), &mut ledger)
            .await;
        assert!(batch.executed[0].timed_out);
        assert_eq!(batch.executed[0].report.status, ToolStatus::Error);
        assert!(ledger.failed_tools.contains("slow"));

        let again = coord
            .run_batch("s1", vec![ToolRequest::new("slow", "")], &view(), Budget::new(10), &mut ledger)
            .await;
        assert!(again.executed.is_empty());
        assert_eq!(again.skipped[0].1, SkipReason::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_high_cost_call_skipped() {
        let executor = ScriptedExecutor::new();
        let coord = coordinator(executor.clone(), 1);
        let mut ledger = ToolLedger::default();
        let batch = coord
            .run_batch(
                "s1",
                vec![
                    ToolRequest::new("web_search", "weather"),
                    ToolRequest::new("web_search", "Weather"),
                    ToolRequest::new("shell", "rm"),
                ],
                &view(),
                Budget::new(10),
                &mut ledger,
            )
            .await;
        assert_eq!(batch.executed.len(), 1);
        let reasons: Vec<SkipReason> = batch.skipped.iter().map(|(_, r)| *r).collect();
        assert_eq!(reasons, vec![SkipReason::Duplicate, SkipReason::Denied]);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_hit_limit() {
        let executor = ScriptedExecutor::new();
        let coord = coordinator(executor.clone(), 1);
        let mut ledger = ToolLedger::default();
        let first = coord
            .run_batch("s1", vec![ToolRequest::new("broken", "")], &view(), Budget::new(10), &mut ledger)
            .await;
        assert!(!first.limit_reached);

        // Critical error: the intervention wait times out, so the call stays failed.
        let second = coord
            .run_batch("s1", vec![ToolRequest::new("locked", "")], &view(), Budget::new(10), &mut ledger)
            .await;
        assert!(!second.executed[0].retried);
        assert_eq!(ledger.consecutive_failures, 2);
        assert!(second.limit_reached);

        let blocked = coord
            .run_batch(
                "s1",
                vec![ToolRequest::new("memory_recall", "")],
                &view(),
                Budget::new(10),
                &mut ledger,
            )
            .await;
        assert_eq!(blocked.skipped[0].1, SkipReason::LimitReached);
        assert!(blocked.executed.is_empty());
    }

    #[tokio::test]
    async fn test_approved_intervention_retries_once() {
        let executor = ScriptedExecutor::new();
        let gate = Arc::new(PermissionGate::new(&ApprovalSection {
            timeout_secs: 60,
            safe_tools: vec![],
            denied_tools: vec![],
        }));
        let coord = ToolCoordinator::new(executor.clone(), Arc::clone(&gate), limits());

        let resolver = tokio::spawn(async move {
            loop {
                if let Some(request) = gate.pending().await.into_iter().next() {
                    gate.resolve(
                        &request.request_id,
                        crate::approval::ApprovalResponse {
                            approved: true,
                            always_allow: false,
                        },
                    )
                    .await;
                    return;
                }
                tokio::task::yield_now().await;
            }
        });

        let mut ledger = ToolLedger::default();
        let batch = coord
            .run_batch("s1", vec![ToolRequest::new("locked", "")], &view(), Budget::new(10), &mut ledger)
            .await;
        resolver.await.unwrap();

        assert!(batch.executed[0].retried);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.total_calls, 2);
        assert!(ledger.failed_tools.contains("locked"));
    }

    #[tokio::test]
    async fn test_total_call_limit() {
        let executor = ScriptedExecutor::new();
        let coord = coordinator(executor.clone(), 1);
        let mut ledger = ToolLedger::default();
        let requests: Vec<ToolRequest> = (0..6)
            .map(|i| ToolRequest::new(format!("tool_{}", i), ""))
            .collect();
        let batch = coord
            .run_batch("s1", requests, &view(), Budget::new(10), &mut ledger)
            .await;
        assert_eq!(batch.executed.len(), 4);
        assert_eq!(batch.skipped.len(), 2);
        assert!(batch.limit_reached);
        assert_eq!(executor.seen.lock().unwrap().len(), 4);
    }
}
