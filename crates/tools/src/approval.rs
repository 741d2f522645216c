//! Out-of-scope approval workflow — tool calls whose target falls outside
//! the saved repository pause until a human approves or denies via the
//! REST API. A timeout guarantees the turn never blocks indefinitely; a
//! timed-out request is a denial.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The decision made by a human reviewer.
#[derive(Debug)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: Option<String> },
}

/// A pending approval awaiting review.
pub struct PendingApproval {
    pub id: Uuid,
    pub tool: String,
    pub target: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub respond: oneshot::Sender<ApprovalDecision>,
}

/// Serializable snapshot for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub tool: String,
    pub target: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingApproval> for ApprovalInfo {
    fn from(p: &PendingApproval) -> Self {
        Self {
            id: p.id,
            tool: p.tool.clone(),
            target: p.target.clone(),
            session_id: p.session_id.clone(),
            created_at: p.created_at,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread-safe store of pending approvals. Each one carries a
/// `oneshot::Sender` that unblocks the waiting tool call when resolved.
pub struct ApprovalStore {
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new pending approval. Returns its info snapshot and the
    /// receiver the caller awaits.
    pub fn request(
        &self,
        tool: &str,
        target: &str,
        session_id: &str,
    ) -> (ApprovalInfo, oneshot::Receiver<ApprovalDecision>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            id: Uuid::new_v4(),
            tool: tool.to_string(),
            target: target.to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            respond: tx,
        };
        let info = ApprovalInfo::from(&pending);
        self.pending.write().insert(pending.id, pending);
        (info, rx)
    }

    /// Resolve as approved. Returns `true` if the id was pending.
    pub fn approve(&self, id: &Uuid) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ApprovalDecision::Approved);
            return true;
        }
        false
    }

    /// Resolve as denied. Returns `true` if the id was pending.
    pub fn deny(&self, id: &Uuid, reason: Option<String>) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ApprovalDecision::Denied { reason });
            return true;
        }
        false
    }

    /// Drop a timed-out request (the receiver already gave up).
    pub fn remove_expired(&self, id: &Uuid) {
        self.pending.write().remove(id);
    }

    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.pending.read().values().map(ApprovalInfo::from).collect()
    }

    /// Wait for a decision with the configured timeout. Timeout is a DENY.
    pub async fn await_decision(
        &self,
        info: &ApprovalInfo,
        rx: oneshot::Receiver<ApprovalDecision>,
    ) -> ApprovalDecision {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => {
                // Sender dropped without a decision (shutdown).
                ApprovalDecision::Denied {
                    reason: Some("approval channel closed".into()),
                }
            }
            Err(_) => {
                self.remove_expired(&info.id);
                tracing::warn!(id = %info.id, tool = %info.tool, "approval timed out; denying");
                ApprovalDecision::Denied {
                    reason: Some("approval timed out".into()),
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApprovalStore {
        ApprovalStore::new(Duration::from_secs(180))
    }

    #[test]
    fn request_and_list() {
        let store = store();
        let (info, _rx) = store.request("file.edit", "/etc/hosts", "s1");
        let list = store.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, info.id);
        assert_eq!(list[0].tool, "file.edit");
    }

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let store = store();
        let (info, rx) = store.request("file.edit", "/repo/x.py", "s1");
        assert!(store.approve(&info.id));
        let decision = store.await_decision(&info, rx).await;
        assert!(matches!(decision, ApprovalDecision::Approved));
        assert!(store.list_pending().is_empty());
    }

    #[tokio::test]
    async fn deny_carries_reason() {
        let store = store();
        let (info, rx) = store.request("bash.execute", "rm -rf /", "s1");
        assert!(store.deny(&info.id, Some("out of scope".into())));
        match store.await_decision(&info, rx).await {
            ApprovalDecision::Denied { reason } => {
                assert_eq!(reason.as_deref(), Some("out of scope"));
            }
            _ => panic!("expected Denied"),
        }
    }

    #[tokio::test]
    async fn timeout_is_deny() {
        let store = ApprovalStore::new(Duration::from_millis(20));
        let (info, rx) = store.request("file.write", "/outside", "s1");
        let decision = store.await_decision(&info, rx).await;
        assert!(matches!(decision, ApprovalDecision::Denied { .. }));
        // The expired request is cleaned up.
        assert!(store.list_pending().is_empty());
    }

    #[test]
    fn resolve_unknown_id_returns_false() {
        let store = store();
        assert!(!store.approve(&Uuid::new_v4()));
        assert!(!store.deny(&Uuid::new_v4(), None));
    }
}
