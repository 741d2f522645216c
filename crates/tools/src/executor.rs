//! The single entry point for tool execution: match a command against the
//! workflow registry first, fall through to a single tool call.
//!
//! Permission denial inside a defined gate surfaces as a `Blocked` outcome
//! (the turn continues and acknowledges the blockage); transport and tool
//! errors surface as `Failed`.

use std::sync::Arc;

use serde_json::{Map, Value};

use cox_domain::claim::Claim;
use cox_domain::error::{Error, Result};
use cox_domain::turn::Mode;
use cox_workflows::WorkflowRegistry;

use crate::claims::extract_claims;
use crate::engine::{summarize, WorkflowEngine, WorkflowStatus};
use crate::permissions::{GateOutcome, PermissionGate};
use crate::transport::ToolTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Blocked,
    Failed,
}

/// What happened when a command was executed, formatted by the
/// orchestrator into a §4 block.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Tool endpoint or workflow that ran.
    pub invoked: String,
    pub was_workflow: bool,
    pub args: Value,
    pub result_summary: String,
    pub claims: Vec<Claim>,
    /// Full tool result (for toolresults.md).
    pub raw_result: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolExecutor {
    transport: Arc<dyn ToolTransport>,
    gate: Arc<PermissionGate>,
    registry: Arc<WorkflowRegistry>,
    engine: WorkflowEngine,
}

impl ToolExecutor {
    pub fn new(
        transport: Arc<dyn ToolTransport>,
        gate: Arc<PermissionGate>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        let engine = WorkflowEngine::new(transport.clone(), gate.clone(), registry.clone());
        Self {
            transport,
            gate,
            registry,
            engine,
        }
    }

    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    /// Execute a coordinator-translated command.
    ///
    /// `command` is the natural-language form (used for workflow
    /// matching); `tool` + `args` are the coordinator's single-tool
    /// translation, used when no workflow matches.
    pub async fn execute(
        &self,
        command: &str,
        intent: Option<&str>,
        tool: Option<(&str, Value)>,
        mode: Mode,
        session_id: &str,
    ) -> Result<ExecutionOutcome> {
        // Workflow path.
        if let Some(matched) = self.registry.find_match(command, intent).await {
            tracing::debug!(
                workflow = %matched.workflow.name,
                strategy = ?matched.strategy,
                confidence = matched.confidence,
                "command matched a workflow"
            );
            let mut inputs: Map<String, Value> = matched
                .captures
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            // Single-tool args supplement captured inputs.
            if let Some((_, Value::Object(fields))) = &tool {
                for (k, v) in fields {
                    inputs.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }

            let report = self
                .engine
                .run(&matched.workflow, inputs, mode, session_id)
                .await?;
            let status = match report.status {
                WorkflowStatus::Succeeded => ExecutionStatus::Ok,
                WorkflowStatus::Blocked => ExecutionStatus::Blocked,
                WorkflowStatus::Failed => ExecutionStatus::Failed,
            };
            let summary = match (&report.message, status) {
                (Some(m), _) => m.clone(),
                (None, _) => format!(
                    "workflow {} completed: {} steps",
                    report.workflow,
                    report.steps.len()
                ),
            };
            return Ok(ExecutionOutcome {
                status,
                invoked: report.workflow.clone(),
                was_workflow: true,
                args: Value::Object(report.variables.clone()),
                result_summary: summary,
                claims: report.claims.clone(),
                raw_result: Some(serde_json::to_value(&report)?),
            });
        }

        // Single-tool path.
        let Some((tool_name, args)) = tool else {
            return Err(Error::Tool {
                tool: "coordinator".into(),
                message: format!("no workflow matched and no tool was named for: {command}"),
            });
        };

        match self.gate.authorize(tool_name, &args, mode, session_id).await {
            GateOutcome::Allow => {}
            GateOutcome::Deny { reason } => {
                return Ok(ExecutionOutcome {
                    status: ExecutionStatus::Blocked,
                    invoked: tool_name.to_string(),
                    was_workflow: false,
                    args,
                    result_summary: reason,
                    claims: Vec::new(),
                    raw_result: None,
                });
            }
        }

        match self.transport.invoke(tool_name, &args, mode).await {
            Ok(result) => Ok(ExecutionOutcome {
                status: ExecutionStatus::Ok,
                invoked: tool_name.to_string(),
                was_workflow: false,
                args,
                result_summary: summarize(&result),
                claims: extract_claims(tool_name, &result),
                raw_result: Some(result),
            }),
            Err(e) => Ok(ExecutionOutcome {
                status: ExecutionStatus::Failed,
                invoked: tool_name.to_string(),
                was_workflow: false,
                args,
                result_summary: e.to_string(),
                claims: Vec::new(),
                raw_result: None,
            }),
        }
    }
}
