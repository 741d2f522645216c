//! Workflow step engine.
//!
//! Evaluates a workflow's steps in order, substituting `{{var}}`
//! placeholders from the variable bag, binding step outputs back into it,
//! then checking the success criteria as a conjunction. On failure the
//! fallback workflow (when set and different) runs once; otherwise the
//! report carries the fallback message.

use std::sync::Arc;

use serde_json::{Map, Value};

use cox_domain::claim::Claim;
use cox_domain::error::Result;
use cox_domain::turn::Mode;
use cox_domain::workflow::Workflow;
use cox_workflows::WorkflowRegistry;

use crate::claims::extract_claims;
use crate::permissions::{GateOutcome, PermissionGate};
use crate::transport::ToolTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Report types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StepReport {
    pub name: String,
    pub tool: String,
    pub ok: bool,
    pub summary: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowRunReport {
    pub workflow: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepReport>,
    /// Final variable bag (inputs + bound step outputs).
    pub variables: Map<String, Value>,
    pub claims: Vec<Claim>,
    /// Failure or blockage explanation (fallback message on failure).
    pub message: Option<String>,
    /// Name of the fallback workflow that ran, when one did.
    pub fallback_used: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkflowEngine {
    transport: Arc<dyn ToolTransport>,
    gate: Arc<PermissionGate>,
    registry: Arc<WorkflowRegistry>,
}

impl WorkflowEngine {
    pub fn new(
        transport: Arc<dyn ToolTransport>,
        gate: Arc<PermissionGate>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            transport,
            gate,
            registry,
        }
    }

    /// Run a workflow to completion, including one level of fallback.
    pub async fn run(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        mode: Mode,
        session_id: &str,
    ) -> Result<WorkflowRunReport> {
        let mut report = self
            .run_once(workflow, inputs.clone(), mode, session_id)
            .await?;
        if report.status != WorkflowStatus::Failed {
            return Ok(report);
        }

        if let Some(fallback) = &workflow.fallback {
            if let Some(name) = &fallback.workflow {
                if name != &workflow.name {
                    if let Some(fb_workflow) = self.registry.get(name) {
                        tracing::info!(
                            workflow = %workflow.name,
                            fallback = %name,
                            "workflow failed; running fallback"
                        );
                        let mut fb_report =
                            self.run_once(&fb_workflow, inputs, mode, session_id).await?;
                        fb_report.fallback_used = Some(name.clone());
                        if fb_report.status == WorkflowStatus::Failed {
                            fb_report.message = Some(fallback.message.clone());
                        }
                        return Ok(fb_report);
                    }
                    tracing::warn!(fallback = %name, "fallback workflow not in registry");
                }
            }
            report.message = Some(fallback.message.clone());
        }
        Ok(report)
    }

    async fn run_once(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        mode: Mode,
        session_id: &str,
    ) -> Result<WorkflowRunReport> {
        let mut report = WorkflowRunReport {
            workflow: workflow.name.clone(),
            status: WorkflowStatus::Succeeded,
            steps: Vec::new(),
            variables: inputs,
            claims: Vec::new(),
            message: None,
            fallback_used: None,
        };

        // Apply declared defaults, then check required inputs.
        for input in &workflow.inputs {
            if report.variables.contains_key(&input.name) {
                continue;
            }
            if let Some(default) = &input.default {
                report.variables.insert(input.name.clone(), default.clone());
            }
        }
        let missing: Vec<&str> = workflow
            .required_inputs()
            .into_iter()
            .filter(|name| !report.variables.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            report.status = WorkflowStatus::Failed;
            report.message = Some(format!("missing required inputs: {}", missing.join(", ")));
            return Ok(report);
        }

        // Step loop.
        for step in &workflow.steps {
            let args = match substitute_args(&step.args, &report.variables) {
                Ok(args) => Value::Object(args),
                Err(unresolved) => {
                    report.status = WorkflowStatus::Failed;
                    report.message =
                        Some(format!("step {}: unresolved placeholder {{{{{unresolved}}}}}", step.name));
                    report.steps.push(StepReport {
                        name: step.name.clone(),
                        tool: step.tool.clone(),
                        ok: false,
                        summary: "unresolved placeholder".into(),
                    });
                    return Ok(report);
                }
            };

            match self.gate.authorize(&step.tool, &args, mode, session_id).await {
                GateOutcome::Allow => {}
                GateOutcome::Deny { reason } => {
                    report.status = WorkflowStatus::Blocked;
                    report.message = Some(reason.clone());
                    report.steps.push(StepReport {
                        name: step.name.clone(),
                        tool: step.tool.clone(),
                        ok: false,
                        summary: format!("blocked: {reason}"),
                    });
                    return Ok(report);
                }
            }

            match self.transport.invoke(&step.tool, &args, mode).await {
                Ok(result) => {
                    report.claims.extend(extract_claims(&step.tool, &result));
                    bind_outputs(&step.outputs, &result, &mut report.variables);
                    report.steps.push(StepReport {
                        name: step.name.clone(),
                        tool: step.tool.clone(),
                        ok: true,
                        summary: summarize(&result),
                    });
                }
                Err(e) => {
                    report.status = WorkflowStatus::Failed;
                    report.message = Some(e.to_string());
                    report.steps.push(StepReport {
                        name: step.name.clone(),
                        tool: step.tool.clone(),
                        ok: false,
                        summary: e.to_string(),
                    });
                    return Ok(report);
                }
            }
        }

        // Success criteria: a conjunction over the variable bag.
        for criterion in &workflow.success_criteria {
            if !evaluate_criterion(criterion, &report.variables) {
                report.status = WorkflowStatus::Failed;
                report.message = Some(format!("success criterion failed: {criterion}"));
                return Ok(report);
            }
        }

        Ok(report)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Placeholder substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Substitute `{{var}}` placeholders in string args from the variable bag.
/// A string that is exactly one placeholder takes the variable's JSON value
/// verbatim; embedded placeholders stringify. Returns the unresolved name
/// on failure.
fn substitute_args(
    args: &Map<String, Value>,
    variables: &Map<String, Value>,
) -> std::result::Result<Map<String, Value>, String> {
    let mut out = Map::new();
    for (key, value) in args {
        out.insert(key.clone(), substitute_value(value, variables)?);
    }
    Ok(out)
}

fn substitute_value(
    value: &Value,
    variables: &Map<String, Value>,
) -> std::result::Result<Value, String> {
    match value {
        Value::String(s) => substitute_string(s, variables),
        Value::Array(xs) => xs
            .iter()
            .map(|v| substitute_value(v, variables))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(m) => substitute_args(m, variables).map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn substitute_string(
    s: &str,
    variables: &Map<String, Value>,
) -> std::result::Result<Value, String> {
    let trimmed = s.trim();
    // Whole-string placeholder keeps the variable's type.
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let name = trimmed[2..trimmed.len() - 2].trim();
        return variables.get(name).cloned().ok_or_else(|| name.to_string());
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let name = after[..close].trim();
        match variables.get(name) {
            Some(Value::String(v)) => out.push_str(v),
            Some(v) => out.push_str(&v.to_string()),
            None => return Err(name.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Bind step outputs into the bag: object results bind by field name, any
/// other shape binds whole to the first output name.
fn bind_outputs(outputs: &[String], result: &Value, variables: &mut Map<String, Value>) {
    if outputs.is_empty() {
        return;
    }
    if let Value::Object(fields) = result {
        let mut bound_any = false;
        for name in outputs {
            if let Some(v) = fields.get(name) {
                variables.insert(name.clone(), v.clone());
                bound_any = true;
            }
        }
        if bound_any {
            return;
        }
    }
    variables.insert(outputs[0].clone(), result.clone());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Success criteria
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supported predicate forms:
///   `<var> exists` · `<var> is not empty` · `<var> == <value>` ·
///   `<var> >= <number>` · `<var> contains <text>`
/// Unknown forms evaluate false (and are logged).
fn evaluate_criterion(criterion: &str, variables: &Map<String, Value>) -> bool {
    let c = criterion.trim();

    if let Some(name) = c.strip_suffix(" exists") {
        return variables.contains_key(name.trim());
    }
    if let Some(name) = c.strip_suffix(" is not empty") {
        return match variables.get(name.trim()) {
            Some(Value::Array(xs)) => !xs.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Object(m)) => !m.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
    }
    if let Some((name, expected)) = c.split_once(" == ") {
        return variables
            .get(name.trim())
            .map(|v| value_as_string(v) == expected.trim().trim_matches('"'))
            .unwrap_or(false);
    }
    if let Some((name, threshold)) = c.split_once(" >= ") {
        let Ok(threshold) = threshold.trim().parse::<f64>() else {
            return false;
        };
        return match variables.get(name.trim()) {
            Some(Value::Number(n)) => n.as_f64().map(|v| v >= threshold).unwrap_or(false),
            Some(Value::Array(xs)) => xs.len() as f64 >= threshold,
            _ => false,
        };
    }
    if let Some((name, needle)) = c.split_once(" contains ") {
        let needle = needle.trim().trim_matches('"');
        return variables
            .get(name.trim())
            .map(|v| value_as_string(v).contains(needle))
            .unwrap_or(false);
    }

    tracing::warn!(criterion = c, "unrecognized success criterion; treating as failed");
    false
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One-line summary of a tool result for step reports and §4 blocks.
pub fn summarize(result: &Value) -> String {
    let text = match result {
        Value::Object(m) => {
            if let Some(s) = m.get("summary").and_then(Value::as_str) {
                s.to_string()
            } else if let Some(xs) = m.get("results").and_then(Value::as_array) {
                format!("{} results", xs.len())
            } else {
                result.to_string()
            }
        }
        other => other.to_string(),
    };
    if text.len() > 200 {
        let mut end = 200;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use cox_domain::config::ToolsConfig;
    use parking_lot::Mutex;

    use crate::approval::ApprovalStore;

    struct FakeTransport {
        calls: Mutex<Vec<(String, Value)>>,
        /// tool name -> scripted result (errors for names starting "fail").
        results: serde_json::Map<String, Value>,
    }

    #[async_trait]
    impl ToolTransport for FakeTransport {
        async fn invoke(&self, tool: &str, args: &Value, _mode: Mode) -> Result<Value> {
            self.calls.lock().push((tool.to_string(), args.clone()));
            if tool.starts_with("fail") {
                return Err(cox_domain::error::Error::Tool {
                    tool: tool.to_string(),
                    message: "scripted failure".into(),
                });
            }
            Ok(self.results.get(tool).cloned().unwrap_or(Value::Null))
        }
    }

    const RESEARCH_WF: &str = r#"
name: research_product
inputs:
  - name: product
    required: true
  - name: max_results
    default: 5
steps:
  - name: research
    tool: internet.research
    args:
      query: "cheapest {{product}}"
      limit: "{{max_results}}"
    outputs: [listings]
success_criteria:
  - "listings is not empty"
"#;

    fn load_registry(sources: &[&str]) -> Arc<WorkflowRegistry> {
        let tmp = tempfile::tempdir().unwrap();
        for (i, src) in sources.iter().enumerate() {
            std::fs::write(tmp.path().join(format!("w{i}.yaml")), src).unwrap();
        }
        Arc::new(WorkflowRegistry::load(tmp.path(), 0.7, None).unwrap())
    }

    fn build_engine(
        results: Value,
        registry: Arc<WorkflowRegistry>,
        timeout_ms: u64,
    ) -> (Arc<FakeTransport>, WorkflowEngine) {
        let transport = Arc::new(FakeTransport {
            calls: Mutex::new(Vec::new()),
            results: results.as_object().cloned().unwrap_or_default(),
        });
        let gate = Arc::new(PermissionGate::new(
            ToolsConfig {
                saved_repo: Some("/repo".into()),
                ..ToolsConfig::default()
            },
            Arc::new(ApprovalStore::new(Duration::from_millis(timeout_ms))),
        ));
        (
            transport.clone(),
            WorkflowEngine::new(transport, gate, registry),
        )
    }

    fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn happy_path_binds_outputs_and_passes_criteria() {
        let registry = load_registry(&[RESEARCH_WF]);
        let results = serde_json::json!({
            "internet.research": {
                "listings": [{"title": "Acer", "url": "https://shop.example/a", "price": "$899"}],
                "summary": "1 result"
            }
        });
        let (transport, engine) = build_engine(results, registry.clone(), 10);
        let wf = registry.get("research_product").unwrap();

        let report = engine
            .run(
                &wf,
                inputs(&[("product", serde_json::json!("laptop"))]),
                Mode::Chat,
                "s1",
            )
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Succeeded);
        assert_eq!(report.steps.len(), 1);
        assert!(report.variables.contains_key("listings"));

        // Placeholder substitution: embedded string + whole-value default.
        let calls = transport.calls.lock();
        assert_eq!(calls[0].1["query"], "cheapest laptop");
        assert_eq!(calls[0].1["limit"], 5);
    }

    #[tokio::test]
    async fn missing_required_input_fails_cleanly() {
        let registry = load_registry(&[RESEARCH_WF]);
        let (_t, engine) = build_engine(serde_json::json!({}), registry.clone(), 10);
        let wf = registry.get("research_product").unwrap();

        let report = engine.run(&wf, Map::new(), Mode::Chat, "s1").await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.message.unwrap().contains("product"));
        assert!(report.steps.is_empty());
    }

    #[tokio::test]
    async fn failed_criterion_fails_workflow() {
        let registry = load_registry(&[RESEARCH_WF]);
        let results = serde_json::json!({
            "internet.research": { "listings": [] }
        });
        let (_t, engine) = build_engine(results, registry.clone(), 10);
        let wf = registry.get("research_product").unwrap();

        let report = engine
            .run(
                &wf,
                inputs(&[("product", serde_json::json!("laptop"))]),
                Mode::Chat,
                "s1",
            )
            .await
            .unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.message.unwrap().contains("listings is not empty"));
    }

    #[tokio::test]
    async fn fallback_workflow_runs_once() {
        let primary = r#"
name: research_product
steps:
  - name: research
    tool: fail.research
fallback:
  workflow: quick_search
  message: "research failed; quick search instead"
"#;
        let fallback = r#"
name: quick_search
steps:
  - name: search
    tool: web.search
    outputs: [hits]
"#;
        let registry = load_registry(&[primary, fallback]);
        let results = serde_json::json!({
            "web.search": {"hits": [{"url": "https://x.example"}]}
        });
        let (transport, engine) = build_engine(results, registry.clone(), 10);
        let wf = registry.get("research_product").unwrap();

        let report = engine.run(&wf, Map::new(), Mode::Chat, "s1").await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Succeeded);
        assert_eq!(report.fallback_used.as_deref(), Some("quick_search"));
        let calls = transport.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "web.search");
    }

    #[tokio::test]
    async fn fallback_message_reported_when_no_fallback_workflow() {
        let primary = r#"
name: research_product
steps:
  - name: research
    tool: fail.research
fallback:
  message: "nothing else to try"
"#;
        let registry = load_registry(&[primary]);
        let (_t, engine) = build_engine(serde_json::json!({}), registry.clone(), 10);
        let wf = registry.get("research_product").unwrap();

        let report = engine.run(&wf, Map::new(), Mode::Chat, "s1").await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.message.as_deref(), Some("nothing else to try"));
    }

    #[tokio::test]
    async fn write_step_in_chat_mode_blocks() {
        let wf_src = r#"
name: edit_files
steps:
  - name: edit
    tool: file.edit
    args:
      path: "/repo/auth.py"
"#;
        let registry = load_registry(&[wf_src]);
        let (_t, engine) = build_engine(serde_json::json!({}), registry.clone(), 10);
        let wf = registry.get("edit_files").unwrap();

        let report = engine.run(&wf, Map::new(), Mode::Chat, "s1").await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Blocked);
        assert!(report.message.unwrap().contains("requires code mode"));
    }

    #[tokio::test]
    async fn unresolved_placeholder_fails() {
        let wf_src = r#"
name: broken_args
steps:
  - name: s
    tool: web.search
    args:
      query: "{{missing_var}}"
"#;
        let registry = load_registry(&[wf_src]);
        let (_t, engine) = build_engine(serde_json::json!({}), registry.clone(), 10);
        let wf = registry.get("broken_args").unwrap();

        let report = engine.run(&wf, Map::new(), Mode::Chat, "s1").await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.message.unwrap().contains("missing_var"));
    }

    #[test]
    fn criteria_forms() {
        let vars = inputs(&[
            ("listings", serde_json::json!(["a"])),
            ("status", serde_json::json!("ok")),
            ("count", serde_json::json!(3)),
            ("summary", serde_json::json!("found 3 laptops")),
        ]);
        assert!(evaluate_criterion("listings exists", &vars));
        assert!(evaluate_criterion("listings is not empty", &vars));
        assert!(evaluate_criterion("status == ok", &vars));
        assert!(evaluate_criterion("count >= 2", &vars));
        assert!(evaluate_criterion("listings >= 1", &vars));
        assert!(evaluate_criterion("summary contains laptops", &vars));
        assert!(!evaluate_criterion("missing exists", &vars));
        assert!(!evaluate_criterion("count >= 10", &vars));
        assert!(!evaluate_criterion("gibberish predicate here?!", &vars));
    }
}
