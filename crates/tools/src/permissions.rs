//! The three-layer permission gate.
//!
//! 1. Mode gate — chat mode denies the write set outright.
//! 2. Repository scope — targets under `SAVED_REPO` pass; anything else
//!    escalates.
//! 3. Approval — escalated calls block on a human decision with a timeout
//!    that defaults to deny.
//!
//! The layers run independently of the tool endpoint's own checks: the
//! endpoint re-verifies the mode header and rejects write operations
//! missing it.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use cox_domain::config::ToolsConfig;
use cox_domain::turn::Mode;

use crate::approval::{ApprovalDecision, ApprovalStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Allow,
    /// Denied inside a defined gate — surfaces as a blocked tool call,
    /// not a turn failure.
    Deny { reason: String },
}

impl GateOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateOutcome::Allow)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PermissionGate {
    cfg: ToolsConfig,
    approvals: Arc<ApprovalStore>,
}

impl PermissionGate {
    pub fn new(cfg: ToolsConfig, approvals: Arc<ApprovalStore>) -> Self {
        Self { cfg, approvals }
    }

    pub fn approvals(&self) -> Arc<ApprovalStore> {
        self.approvals.clone()
    }

    /// Layer 1: the mode gate.
    pub fn check_mode(&self, tool: &str, mode: Mode) -> GateOutcome {
        if !self.cfg.enforce_mode_gates {
            return GateOutcome::Allow;
        }
        if mode == Mode::Chat && self.cfg.is_write_tool(tool) {
            return GateOutcome::Deny {
                reason: format!("{tool} requires code mode"),
            };
        }
        GateOutcome::Allow
    }

    /// Layer 2: repository scope. `None` means the call names no
    /// filesystem target and the layer does not apply.
    pub fn needs_approval(&self, target: Option<&str>) -> bool {
        let Some(target) = target else {
            return false;
        };
        match &self.cfg.saved_repo {
            Some(repo) => !Path::new(target).starts_with(repo),
            // No repo configured: every targeted call escalates.
            None => true,
        }
    }

    /// All three layers. Blocks on approval when the scope check
    /// escalates; an approval timeout is a deny.
    pub async fn authorize(
        &self,
        tool: &str,
        args: &Value,
        mode: Mode,
        session_id: &str,
    ) -> GateOutcome {
        if let deny @ GateOutcome::Deny { .. } = self.check_mode(tool, mode) {
            return deny;
        }

        let target = extract_target(args);
        if !self.needs_approval(target.as_deref()) {
            return GateOutcome::Allow;
        }

        let target = target.unwrap_or_default();
        let (info, rx) = self.approvals.request(tool, &target, session_id);
        tracing::info!(
            id = %info.id,
            tool,
            target = %target,
            "tool target outside saved repo; awaiting approval"
        );
        match self.approvals.await_decision(&info, rx).await {
            ApprovalDecision::Approved => GateOutcome::Allow,
            ApprovalDecision::Denied { reason } => GateOutcome::Deny {
                reason: reason.unwrap_or_else(|| "approval denied".into()),
            },
        }
    }
}

/// Pull the filesystem target out of tool args, when one exists.
fn extract_target(args: &Value) -> Option<String> {
    for key in ["path", "file", "target", "cwd", "directory"] {
        if let Some(s) = args.get(key).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
