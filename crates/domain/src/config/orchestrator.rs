use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator loop caps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Iteration and retry budgets for the turn state machine. Exceeding a
/// validation cap promotes the decision to FAIL; exceeding the executor cap
/// exits to synthesis with a termination reason.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "d_executor_iterations")]
    pub max_executor_iterations: u32,
    #[serde(default = "d_revise")]
    pub max_revise: u32,
    #[serde(default = "d_retry")]
    pub max_retry: u32,
    /// Consecutive tool errors before the executor loop gives up.
    #[serde(default = "d_tool_errors")]
    pub max_consecutive_tool_errors: u32,
    /// How many times a validation helper (1.5 / 2.5) may send the
    /// preceding stage back.
    #[serde(default = "d_stage_retry")]
    pub max_stage_retry: u32,
    /// How many times one planner invocation may route refresh_context.
    #[serde(default = "d_refresh")]
    pub max_context_refresh: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_executor_iterations: d_executor_iterations(),
            max_revise: d_revise(),
            max_retry: d_retry(),
            max_consecutive_tool_errors: d_tool_errors(),
            max_stage_retry: d_stage_retry(),
            max_context_refresh: d_refresh(),
        }
    }
}

fn d_executor_iterations() -> u32 {
    10
}
fn d_revise() -> u32 {
    2
}
fn d_retry() -> u32 {
    1
}
fn d_tool_errors() -> u32 {
    3
}
fn d_stage_retry() -> u32 {
    1
}
fn d_refresh() -> u32 {
    1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Intervention queue caps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Backpressure limits for the intervention queue. Over-cap writes merge
/// into an open entry for the session/type and spill to the emergency log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InterventionConfig {
    #[serde(default = "d_max_total")]
    pub max_total: usize,
    #[serde(default = "d_max_per_session")]
    pub max_per_session: usize,
    #[serde(default = "d_max_per_error_type")]
    pub max_per_error_type: usize,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            max_total: d_max_total(),
            max_per_session: d_max_per_session(),
            max_per_error_type: d_max_per_error_type(),
        }
    }
}

fn d_max_total() -> usize {
    50
}
fn d_max_per_session() -> usize {
    5
}
fn d_max_per_error_type() -> usize {
    10
}
