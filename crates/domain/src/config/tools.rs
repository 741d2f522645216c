use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool service & permission gates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound tool service plus the permission-gate settings.
///
/// `TOOL_URL`, `SAVED_REPO`, `ENFORCE_MODE_GATES`, and
/// `EXTERNAL_REPO_TIMEOUT` override the corresponding fields at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "d_tool_url")]
    pub base_url: String,
    /// Mode gate toggle. When off, chat mode no longer denies the write set
    /// locally (the tool endpoint still verifies the mode header itself).
    #[serde(default = "d_true")]
    pub enforce_mode_gates: bool,
    /// Path prefix considered in-scope for code-mode operations. Targets
    /// outside it escalate to approval.
    #[serde(default)]
    pub saved_repo: Option<PathBuf>,
    /// Seconds to wait for a human approval before denying.
    #[serde(default = "d_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// Tools denied in chat mode.
    #[serde(default = "d_write_set")]
    pub write_set: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            base_url: d_tool_url(),
            enforce_mode_gates: true,
            saved_repo: None,
            approval_timeout_secs: d_approval_timeout(),
            write_set: d_write_set(),
        }
    }
}

impl ToolsConfig {
    pub fn is_write_tool(&self, tool: &str) -> bool {
        self.write_set.iter().any(|t| t == tool)
    }
}

fn d_tool_url() -> String {
    "http://localhost:8100".into()
}
fn d_true() -> bool {
    true
}
fn d_approval_timeout() -> u64 {
    180
}
fn d_write_set() -> Vec<String> {
    [
        "file.write",
        "file.edit",
        "file.create",
        "file.delete",
        "git.add",
        "git.commit",
        "git.push",
        "git.reset",
        "bash.execute",
        "bash.kill",
        "test.run",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
