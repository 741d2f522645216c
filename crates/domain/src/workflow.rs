//! Declarative workflow definitions — named, parameterized sequences of tool
//! steps with success criteria and a fallback.
//!
//! Definitions are YAML files loaded at startup by `cox-workflows`. A
//! trigger is either an intent object (`{intent: research_product}`) or a
//! bare pattern string, which may contain `{placeholder}` captures.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Triggers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    /// `{intent: some_intent_name}`
    Intent { intent: String },
    /// A literal phrase or glob-like pattern with `{placeholder}` captures.
    Pattern(String),
}

impl Trigger {
    pub fn is_pattern(&self) -> bool {
        matches!(self, Trigger::Pattern(_))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs / outputs / steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub name: String,
    /// Declared type: string | number | boolean | list | object.
    #[serde(rename = "type", default = "d_string")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    /// Where a missing value defaults from (e.g. "query", "context").
    #[serde(default)]
    pub default_source: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

fn d_string() -> String {
    "string".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub name: String,
    #[serde(rename = "type", default = "d_string")]
    pub type_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    /// Tool endpoint name, e.g. `internet.research`.
    pub tool: String,
    /// Tool arguments; string values may contain `{{var}}` placeholders.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Variable names the step's result fields bind to.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFallback {
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub message: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default = "d_version")]
    pub version: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub inputs: Vec<WorkflowInput>,
    #[serde(default)]
    pub outputs: Vec<WorkflowOutput>,
    pub steps: Vec<WorkflowStep>,
    /// Predicates over workflow variables, evaluated as a conjunction.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub fallback: Option<WorkflowFallback>,
    /// Bootstrap-only tool family (file IO, code execution): flagged and
    /// excluded from self-creation.
    #[serde(default)]
    pub bootstrap_only: bool,
}

fn d_version() -> String {
    "1".into()
}

/// Validation issues found in a workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl WorkflowValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Workflow {
    pub fn validate(&self) -> WorkflowValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("workflow name must not be empty".into());
        }
        if self.steps.is_empty() {
            errors.push(format!("workflow \"{}\" has no steps", self.name));
        }
        if self.triggers.is_empty() {
            warnings.push(format!(
                "workflow \"{}\" has no triggers — it can only be invoked by name",
                self.name
            ));
        }

        // Step names must be unique (outputs bind into one variable bag).
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                errors.push(format!(
                    "workflow \"{}\": duplicate step name \"{}\"",
                    self.name, step.name
                ));
            }
            if step.tool.trim().is_empty() {
                errors.push(format!(
                    "workflow \"{}\": step \"{}\" has no tool",
                    self.name, step.name
                ));
            }
        }

        // Fallback must not point at the workflow itself.
        if let Some(fb) = &self.fallback {
            if fb.workflow.as_deref() == Some(self.name.as_str()) {
                errors.push(format!(
                    "workflow \"{}\": fallback references itself",
                    self.name
                ));
            }
        }

        WorkflowValidation { errors, warnings }
    }

    /// Names of inputs flagged `required: true`.
    pub fn required_inputs(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|i| i.required)
            .map(|i| i.name.as_str())
            .collect()
    }
}
