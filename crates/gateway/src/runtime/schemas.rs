//! Typed stage outputs and their parser schemas.
//!
//! Every stage's expected shape is declared once here: the forgiving
//! parser enforces the `SchemaSpec`, then the typed struct is read out of
//! the conformed JSON. Decision strings are matched case-insensitively —
//! models drift between `pass`, `PASS`, and `Pass`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cox_domain::error::{Error, Result};
use cox_domain::turn::DataRequirements;
use cox_providers::parse::{FieldKind, FieldSpec, SchemaSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 1 — query analysis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAnalysis {
    #[serde(default)]
    pub user_purpose: String,
    #[serde(default)]
    pub data_requirements: DataRequirements,
    /// Turn numbers the query explicitly references.
    #[serde(default)]
    pub referenced_turns: Vec<u64>,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

pub fn query_analysis_schema() -> SchemaSpec {
    SchemaSpec {
        name: "query_analysis",
        fields: vec![
            FieldSpec::required("user_purpose", FieldKind::String),
            FieldSpec::optional("data_requirements", FieldKind::Object, serde_json::json!({})),
            FieldSpec::optional("referenced_turns", FieldKind::Object, serde_json::json!([])),
            FieldSpec::optional("topic", FieldKind::String, serde_json::json!("")),
            FieldSpec::optional("keywords", FieldKind::StringList, serde_json::json!([])),
        ],
    }
}

impl QueryAnalysis {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Schema {
            schema: "query_analysis".into(),
            message: e.to_string(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stages 1.5 / 2.5 — validation helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperDecision {
    Pass,
    Retry,
    Clarify,
}

#[derive(Debug, Clone)]
pub struct HelperVerdict {
    pub decision: HelperDecision,
    pub issues: Vec<String>,
    pub retry_guidance: Vec<String>,
    pub clarification: Option<String>,
}

pub fn helper_verdict_schema() -> SchemaSpec {
    SchemaSpec {
        name: "helper_verdict",
        fields: vec![
            FieldSpec::required("decision", FieldKind::String),
            FieldSpec::optional("issues", FieldKind::StringList, serde_json::json!([])),
            FieldSpec::optional("retry_guidance", FieldKind::StringList, serde_json::json!([])),
            FieldSpec::optional("clarification", FieldKind::String, Value::Null),
        ],
    }
}

impl HelperVerdict {
    pub fn from_value(value: Value) -> Result<Self> {
        let decision = match value["decision"].as_str().unwrap_or("").to_lowercase().as_str() {
            "pass" => HelperDecision::Pass,
            "retry" => HelperDecision::Retry,
            "clarify" => HelperDecision::Clarify,
            other => {
                return Err(Error::Schema {
                    schema: "helper_verdict".into(),
                    message: format!("unknown decision \"{other}\""),
                })
            }
        };
        Ok(Self {
            decision,
            issues: string_list(&value["issues"]),
            retry_guidance: string_list(&value["retry_guidance"]),
            clarification: value["clarification"].as_str().map(String::from),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 2.2 — context synthesis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSynthesis {
    /// Organized context narrative (becomes the §2 bodies).
    #[serde(default)]
    pub summary: String,
    /// Information the synthesis knows is missing.
    #[serde(default)]
    pub gaps: Vec<String>,
}

pub fn context_synthesis_schema() -> SchemaSpec {
    SchemaSpec {
        name: "context_synthesis",
        fields: vec![
            FieldSpec::required("summary", FieldKind::String),
            FieldSpec::optional("gaps", FieldKind::StringList, serde_json::json!([])),
        ],
    }
}

impl ContextSynthesis {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Schema {
            schema: "context_synthesis".into(),
            message: e.to_string(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 3 — strategic plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRoute {
    Executor,
    Synthesis,
    Clarify,
    RefreshContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGoal {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StrategicPlan {
    pub goals: Vec<PlanGoal>,
    pub approach: String,
    pub success_criteria: Vec<String>,
    pub route: PlanRoute,
    pub clarification: Option<String>,
    /// Items the planner wants re-retrieved on refresh_context.
    pub missing_items: Vec<String>,
}

pub fn strategic_plan_schema() -> SchemaSpec {
    SchemaSpec {
        name: "strategic_plan",
        fields: vec![
            FieldSpec::required("route", FieldKind::String),
            FieldSpec::optional("goals", FieldKind::Object, serde_json::json!([])),
            FieldSpec::optional("approach", FieldKind::String, serde_json::json!("")),
            FieldSpec::optional("success_criteria", FieldKind::StringList, serde_json::json!([])),
            FieldSpec::optional("clarification", FieldKind::String, Value::Null),
            FieldSpec::optional("missing_items", FieldKind::StringList, serde_json::json!([])),
        ],
    }
}

impl StrategicPlan {
    pub fn from_value(value: Value) -> Result<Self> {
        let route = match value["route"].as_str().unwrap_or("").to_lowercase().as_str() {
            "executor" => PlanRoute::Executor,
            "synthesis" => PlanRoute::Synthesis,
            "clarify" => PlanRoute::Clarify,
            "refresh_context" => PlanRoute::RefreshContext,
            other => {
                return Err(Error::Schema {
                    schema: "strategic_plan".into(),
                    message: format!("unknown route \"{other}\""),
                })
            }
        };
        let goals = serde_json::from_value(value["goals"].clone()).unwrap_or_default();
        Ok(Self {
            goals,
            approach: value["approach"].as_str().unwrap_or("").to_string(),
            success_criteria: string_list(&value["success_criteria"]),
            route,
            clarification: value["clarification"].as_str().map(String::from),
            missing_items: string_list(&value["missing_items"]),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 4 — executor actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutorActionKind {
    Command,
    Analyze,
    Complete,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct ExecutorAction {
    pub action: ExecutorActionKind,
    /// Natural-language command (COMMAND).
    pub command: Option<String>,
    /// Analysis text (ANALYZE).
    pub analysis: Option<String>,
    /// Why progress stopped (BLOCKED).
    pub reason: Option<String>,
}

pub fn executor_action_schema() -> SchemaSpec {
    SchemaSpec {
        name: "executor_action",
        fields: vec![
            FieldSpec::required("action", FieldKind::String),
            FieldSpec::optional("command", FieldKind::String, Value::Null),
            FieldSpec::optional("analysis", FieldKind::String, Value::Null),
            FieldSpec::optional("reason", FieldKind::String, Value::Null),
        ],
    }
}

impl ExecutorAction {
    pub fn from_value(value: Value) -> Result<Self> {
        let action = match value["action"].as_str().unwrap_or("").to_uppercase().as_str() {
            "COMMAND" => ExecutorActionKind::Command,
            "ANALYZE" => ExecutorActionKind::Analyze,
            "COMPLETE" => ExecutorActionKind::Complete,
            "BLOCKED" => ExecutorActionKind::Blocked,
            other => {
                return Err(Error::Schema {
                    schema: "executor_action".into(),
                    message: format!("unknown action \"{other}\""),
                })
            }
        };
        Ok(Self {
            action,
            command: value["command"].as_str().map(String::from),
            analysis: value["analysis"].as_str().map(String::from),
            reason: value["reason"].as_str().map(String::from),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 5 — coordinator translation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct CoordinatorTranslation {
    /// Single tool to invoke when no workflow matches.
    pub tool: Option<String>,
    pub args: Value,
    /// Parsed intent for exact workflow matching.
    pub intent: Option<String>,
}

pub fn coordinator_schema() -> SchemaSpec {
    SchemaSpec {
        name: "coordinator_translation",
        fields: vec![
            FieldSpec::optional("tool", FieldKind::String, Value::Null),
            FieldSpec::optional("args", FieldKind::Object, serde_json::json!({})),
            FieldSpec::optional("intent", FieldKind::String, Value::Null),
        ],
    }
}

impl CoordinatorTranslation {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(Self {
            tool: value["tool"].as_str().map(String::from),
            args: value.get("args").cloned().unwrap_or(serde_json::json!({})),
            intent: value["intent"].as_str().map(String::from),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 6 — synthesis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisOut {
    pub response: String,
    /// Self-checklist rendered under the response preview in §6.
    #[serde(default)]
    pub checklist: Vec<String>,
}

pub fn synthesis_schema() -> SchemaSpec {
    SchemaSpec {
        name: "synthesis",
        fields: vec![
            FieldSpec::required("response", FieldKind::String),
            FieldSpec::optional("checklist", FieldKind::StringList, serde_json::json!([])),
        ],
    }
}

impl SynthesisOut {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Schema {
            schema: "synthesis".into(),
            message: e.to_string(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 7 — final validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationDecision {
    Approve,
    Revise,
    Retry,
    Fail,
}

impl ValidationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationDecision::Approve => "APPROVE",
            ValidationDecision::Revise => "REVISE",
            ValidationDecision::Retry => "RETRY",
            ValidationDecision::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinalValidation {
    pub decision: ValidationDecision,
    pub confidence: f64,
    /// Per-check booleans (goal coverage, claim support, tone, ...).
    pub checks: serde_json::Map<String, Value>,
    pub revision_hints: Vec<String>,
    pub suggested_fixes: Vec<String>,
}

pub fn final_validation_schema() -> SchemaSpec {
    SchemaSpec {
        name: "final_validation",
        fields: vec![
            FieldSpec::required("decision", FieldKind::String),
            FieldSpec::optional("confidence", FieldKind::Number, serde_json::json!(0.5)),
            FieldSpec::optional("checks", FieldKind::Object, serde_json::json!({})),
            FieldSpec::optional("revision_hints", FieldKind::StringList, serde_json::json!([])),
            FieldSpec::optional("suggested_fixes", FieldKind::StringList, serde_json::json!([])),
        ],
    }
}

impl FinalValidation {
    pub fn from_value(value: Value) -> Result<Self> {
        let decision = match value["decision"].as_str().unwrap_or("").to_uppercase().as_str() {
            "APPROVE" => ValidationDecision::Approve,
            "REVISE" => ValidationDecision::Revise,
            "RETRY" => ValidationDecision::Retry,
            "FAIL" => ValidationDecision::Fail,
            other => {
                return Err(Error::Schema {
                    schema: "final_validation".into(),
                    message: format!("unknown decision \"{other}\""),
                })
            }
        };
        Ok(Self {
            decision,
            confidence: value["confidence"].as_f64().unwrap_or(0.5),
            checks: value["checks"].as_object().cloned().unwrap_or_default(),
            revision_hints: string_list(&value["revision_hints"]),
            suggested_fixes: string_list(&value["suggested_fixes"]),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn summary (save pipeline)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn turn_summary_schema() -> SchemaSpec {
    SchemaSpec {
        name: "turn_summary",
        fields: vec![
            FieldSpec::required("summary", FieldKind::String),
            FieldSpec::optional("topic", FieldKind::String, serde_json::json!("")),
            FieldSpec::optional("keywords", FieldKind::StringList, serde_json::json!([])),
            FieldSpec::optional("content_type", FieldKind::String, serde_json::json!("general_fact")),
        ],
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reflection (batch reflector)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn reflection_schema() -> SchemaSpec {
    SchemaSpec {
        name: "reflection",
        fields: vec![
            FieldSpec::optional("new_facts", FieldKind::Object, serde_json::json!([])),
            FieldSpec::optional("corrections", FieldKind::Object, serde_json::json!([])),
            FieldSpec::optional("connections", FieldKind::Object, serde_json::json!([])),
            FieldSpec::optional("open_questions", FieldKind::Object, serde_json::json!([])),
        ],
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|xs| {
            xs.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
