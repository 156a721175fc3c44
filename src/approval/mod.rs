//! Permission gate for tool calls and human intervention.
//!
//! Tools are classified as ALLOWED, DENIED or NEEDS_APPROVAL. A call that
//! needs approval registers a pending request backed by a oneshot channel and
//! waits for [`PermissionGate::resolve`]; the wait is bounded by the configured
//! timeout, and both timeout and cancellation resolve to "not approved".

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use uuid::Uuid;

use crate::config::ApprovalSection;
use crate::strategy::ToolRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionStatus {
    Allowed,
    Denied,
    NeedsApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A mutating tool call outside the safe set.
    ToolCall,
    /// A critical tool error (auth, permission, rate limit) needing a human.
    Intervention,
}

/// A request waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub session_id: String,
    pub kind: RequestKind,
    pub tool: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalResponse {
    pub approved: bool,
    /// Remember the approval for this tool for the rest of the session.
    pub always_allow: bool,
}

struct Pending {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalResponse>,
}

/// Shared across the controller and tool coordinator behind an `Arc`.
pub struct PermissionGate {
    safe_tools: HashSet<String>,
    denied_tools: HashSet<String>,
    timeout: Duration,
    /// Per-session "always allow" tool sets.
    session_allow_rules: RwLock<HashMap<String, HashSet<String>>>,
    /// Key: request_id.
    pending: Mutex<HashMap<String, Pending>>,
    /// Where new requests are announced (an approval UI, for instance).
    notifier: RwLock<Option<mpsc::UnboundedSender<ApprovalRequest>>>,
}

impl PermissionGate {
    pub fn new(config: &ApprovalSection) -> Self {
        Self {
            safe_tools: config.safe_tools.iter().cloned().collect(),
            denied_tools: config.denied_tools.iter().cloned().collect(),
            timeout: config.timeout(),
            session_allow_rules: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            notifier: RwLock::new(None),
        }
    }

    /// Announce new requests on `tx`.
    pub async fn set_notifier(&self, tx: mpsc::UnboundedSender<ApprovalRequest>) {
        *self.notifier.write().await = Some(tx);
    }

    /// Classify a call without waiting.
    pub async fn classify(&self, session_id: &str, tool: &str, mutating: bool) -> PermissionStatus {
        if self.denied_tools.contains(tool) {
            return PermissionStatus::Denied;
        }
        if !mutating || self.safe_tools.contains(tool) {
            return PermissionStatus::Allowed;
        }
        let rules = self.session_allow_rules.read().await;
        if rules.get(session_id).is_some_and(|allowed| allowed.contains(tool)) {
            return PermissionStatus::Allowed;
        }
        PermissionStatus::NeedsApproval
    }

    /// Classify and, when approval is needed, wait for it. Never returns
    /// `NeedsApproval`.
    pub async fn check(&self, session_id: &str, request: &ToolRequest) -> PermissionStatus {
        match self
            .classify(session_id, &request.tool, request.mutating)
            .await
        {
            PermissionStatus::NeedsApproval => {
                let approved = self
                    .wait_for_decision(
                        session_id,
                        RequestKind::ToolCall,
                        &request.tool,
                        &request.instruction,
                    )
                    .await;
                if approved {
                    PermissionStatus::Allowed
                } else {
                    PermissionStatus::Denied
                }
            }
            status => status,
        }
    }

    /// Ask a human whether to retry after a critical tool error.
    pub async fn request_intervention(&self, session_id: &str, tool: &str, detail: &str) -> bool {
        self.wait_for_decision(session_id, RequestKind::Intervention, tool, detail)
            .await
    }

    async fn wait_for_decision(
        &self,
        session_id: &str,
        kind: RequestKind,
        tool: &str,
        detail: &str,
    ) -> bool {
        let request = ApprovalRequest {
            request_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            kind,
            tool: tool.to_string(),
            detail: detail.to_string(),
            created_at: Utc::now(),
        };
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(
            request_id.clone(),
            Pending {
                request: request.clone(),
                tx,
            },
        );
        if let Some(notifier) = self.notifier.read().await.as_ref()
            && notifier.send(request).is_err()
        {
            tracing::debug!(%request_id, "Approval notifier closed");
        }
        tracing::info!(session_id, tool, ?kind, %request_id, "Waiting for approval");

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                tracing::info!(%request_id, "Approval request cancelled");
                return false;
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                tracing::warn!(%request_id, tool, "Approval request timed out");
                return false;
            }
        };

        if response.approved && response.always_allow {
            self.allow_always(session_id, tool).await;
        }
        response.approved
    }

    /// Resolve a pending request. Returns false when the id is unknown
    /// (already resolved, timed out or cancelled).
    pub async fn resolve(&self, request_id: &str, response: ApprovalResponse) -> bool {
        let pending = self.pending.lock().await.remove(request_id);
        match pending {
            // The receiver may already be gone after a timeout race.
            Some(p) => p.tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Resolve every pending request as "not approved". Returns how many were
    /// cancelled.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = self.pending.lock().await.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for p in drained {
            let _ = p.tx.send(ApprovalResponse {
                approved: false,
                always_allow: false,
            });
        }
        if count > 0 {
            tracing::info!(count, "Cancelled pending approval requests");
        }
        count
    }

    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub async fn allow_always(&self, session_id: &str, tool: &str) {
        self.session_allow_rules
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(tool.to_string());
    }

    /// Forget a session's "always allow" rules.
    pub async fn clear_session(&self, session_id: &str) {
        self.session_allow_rules.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gate(timeout_secs: u64) -> Arc<PermissionGate> {
        let config = ApprovalSection {
            timeout_secs,
            safe_tools: vec!["web_search".to_string()],
            denied_tools: vec!["shell".to_string()],
        };
        Arc::new(PermissionGate::new(&config))
    }

    fn mutating(tool: &str) -> ToolRequest {
        ToolRequest {
            mutating: true,
            ..ToolRequest::new(tool, "write the file")
        }
    }

    async fn wait_for_pending(gate: &PermissionGate) -> ApprovalRequest {
        loop {
            if let Some(r) = gate.pending().await.into_iter().next() {
                return r;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_classify() {
        let gate = gate(1);
        assert_eq!(gate.classify("s1", "shell", false).await, PermissionStatus::Denied);
        assert_eq!(gate.classify("s1", "web_search", true).await, PermissionStatus::Allowed);
        assert_eq!(gate.classify("s1", "file_write", false).await, PermissionStatus::Allowed);
        assert_eq!(
            gate.classify("s1", "file_write", true).await,
            PermissionStatus::NeedsApproval
        );
        gate.allow_always("s1", "file_write").await;
        assert_eq!(gate.classify("s1", "file_write", true).await, PermissionStatus::Allowed);
        assert_eq!(
            gate.classify("s2", "file_write", true).await,
            PermissionStatus::NeedsApproval
        );
        gate.clear_session("s1").await;
        assert_eq!(
            gate.classify("s1", "file_write", true).await,
            PermissionStatus::NeedsApproval
        );
    }

    #[tokio::test]
    async fn test_check_waits_for_resolution() {
        let gate = gate(60);
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.check("s1", &mutating("file_write")).await })
        };
        let request = wait_for_pending(&gate).await;
        assert_eq!(request.kind, RequestKind::ToolCall);
        assert!(
            gate.resolve(
                &request.request_id,
                ApprovalResponse {
                    approved: true,
                    always_allow: true
                }
            )
            .await
        );
        assert_eq!(waiter.await.unwrap(), PermissionStatus::Allowed);
        // Remembered for the session.
        assert_eq!(
            gate.classify("s1", "file_write", true).await,
            PermissionStatus::Allowed
        );
        assert!(!gate.resolve(&request.request_id, ApprovalResponse { approved: true, always_allow: false }).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_to_denied() {
        let gate = gate(5);
        let status = gate.check("s1", &mutating("file_write")).await;
        assert_eq!(status, PermissionStatus::Denied);
        assert!(gate.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_not_approved() {
        let gate = gate(60);
        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.set_notifier(tx).await;
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.request_intervention("s1", "web_search", "401 unauthorized").await })
        };
        let announced = rx.recv().await.unwrap();
        assert_eq!(announced.kind, RequestKind::Intervention);
        wait_for_pending(&gate).await;

        assert_eq!(gate.cancel_all().await, 1);
        assert!(!waiter.await.unwrap());
        assert!(gate.pending().await.is_empty());
    }
}
