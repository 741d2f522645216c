//! Workflow matching.
//!
//! Strategies in precedence order: exact intent, literal phrase, glob
//! pattern with `{placeholder}` capture, semantic LLM classifier, keyword
//! fallback. The best match at or above the confidence threshold wins;
//! below it, the caller falls through to the single-tool path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use cox_domain::error::Result;
use cox_domain::recipe::Role;
use cox_domain::workflow::{Trigger, Workflow};
use cox_providers::parse::{parse_stage_output, FieldKind, FieldSpec, SchemaSpec};
use cox_providers::{ChatMessage, RoleRouter};

use crate::loader;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Match types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    ExactIntent,
    LiteralPhrase,
    Pattern,
    Semantic,
    Keyword,
}

#[derive(Debug, Clone)]
pub struct WorkflowMatch {
    pub workflow: Workflow,
    pub confidence: f64,
    pub strategy: MatchStrategy,
    /// Placeholder captures from pattern triggers.
    pub captures: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkflowRegistry {
    workflows: RwLock<Vec<Workflow>>,
    dir: PathBuf,
    threshold: f64,
    /// Semantic classifier; absent in minimal deployments and tests.
    router: Option<Arc<RoleRouter>>,
}

impl WorkflowRegistry {
    pub fn load(dir: &Path, threshold: f64, router: Option<Arc<RoleRouter>>) -> Result<Self> {
        let workflows = loader::scan_workflows(dir)?;
        Ok(Self {
            workflows: RwLock::new(workflows),
            dir: dir.to_path_buf(),
            threshold,
            router,
        })
    }

    pub fn empty(threshold: f64) -> Self {
        Self {
            workflows: RwLock::new(Vec::new()),
            dir: PathBuf::new(),
            threshold,
            router: None,
        }
    }

    /// Re-scan the workflow directory (admin signal).
    pub fn reload(&self) -> Result<usize> {
        let workflows = loader::scan_workflows(&self.dir)?;
        let count = workflows.len();
        *self.workflows.write() = workflows;
        tracing::info!(count, "workflow registry reloaded");
        Ok(count)
    }

    pub fn list(&self) -> Vec<Workflow> {
        self.workflows.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Workflow> {
        self.workflows.read().iter().find(|w| w.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }

    // ── Matching ──────────────────────────────────────────────────

    /// Find the best workflow for a command. `intent` is the parsed intent
    /// when the coordinator extracted one. Returns `None` when nothing
    /// clears the threshold (single-tool path).
    pub async fn find_match(&self, command: &str, intent: Option<&str>) -> Option<WorkflowMatch> {
        // Strategies 1-3 are cheap and local; take the first hit.
        if let Some(m) = self.match_local(command, intent) {
            return (m.confidence >= self.threshold).then_some(m);
        }

        // Strategy 4: semantic classifier.
        if let Some(m) = self.match_semantic(command).await {
            if m.confidence >= self.threshold {
                return Some(m);
            }
        }

        // Strategy 5: keyword fallback.
        let m = self.match_keywords(command)?;
        (m.confidence >= self.threshold).then_some(m)
    }

    fn match_local(&self, command: &str, intent: Option<&str>) -> Option<WorkflowMatch> {
        let workflows = self.workflows.read();
        let normalized = command.trim().to_lowercase();

        // 1. Exact intent.
        if let Some(intent) = intent {
            for workflow in workflows.iter() {
                let hit = workflow.triggers.iter().any(
                    |t| matches!(t, Trigger::Intent { intent: i } if i.eq_ignore_ascii_case(intent)),
                );
                if hit {
                    return Some(WorkflowMatch {
                        workflow: workflow.clone(),
                        confidence: 1.0,
                        strategy: MatchStrategy::ExactIntent,
                        captures: HashMap::new(),
                    });
                }
            }
        }

        // 2. Literal phrase (patterns without placeholders or globs).
        for workflow in workflows.iter() {
            for trigger in &workflow.triggers {
                if let Trigger::Pattern(p) = trigger {
                    if !p.contains('{') && !p.contains('*') && p.trim().to_lowercase() == normalized
                    {
                        return Some(WorkflowMatch {
                            workflow: workflow.clone(),
                            confidence: 0.95,
                            strategy: MatchStrategy::LiteralPhrase,
                            captures: HashMap::new(),
                        });
                    }
                }
            }
        }

        // 3. Glob pattern with {placeholder} capture.
        for workflow in workflows.iter() {
            for trigger in &workflow.triggers {
                if let Trigger::Pattern(p) = trigger {
                    if !p.contains('{') && !p.contains('*') {
                        continue;
                    }
                    if let Some(captures) = match_pattern(p, &normalized) {
                        return Some(WorkflowMatch {
                            workflow: workflow.clone(),
                            confidence: 0.85,
                            strategy: MatchStrategy::Pattern,
                            captures,
                        });
                    }
                }
            }
        }

        None
    }

    async fn match_semantic(&self, command: &str) -> Option<WorkflowMatch> {
        let router = self.router.as_ref()?;
        let candidates: Vec<String> = {
            let workflows = self.workflows.read();
            if workflows.is_empty() {
                return None;
            }
            workflows
                .iter()
                .map(|w| format!("- {} (category: {})", w.name, w.category))
                .collect()
        };

        let schema = SchemaSpec {
            name: "workflow_classification",
            fields: vec![
                FieldSpec::required("workflow", FieldKind::String),
                FieldSpec::optional("confidence", FieldKind::Number, serde_json::json!(0.0)),
            ],
        };
        let messages = vec![
            ChatMessage::system(
                "Pick the workflow that best handles the command, or \"none\". \
                 Reply as JSON: {\"workflow\": \"...\", \"confidence\": 0.0-1.0}",
            ),
            ChatMessage::user(format!(
                "Command: {command}\n\nWorkflows:\n{}",
                candidates.join("\n")
            )),
        ];

        let resp = match router.chat_as(Role::Reflex, messages, Some(200), None).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "semantic workflow classification unavailable");
                return None;
            }
        };
        let parsed = match parse_stage_output(&resp.content, &schema) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "semantic classification output unusable");
                return None;
            }
        };

        let name = parsed.value["workflow"].as_str()?.to_string();
        if name == "none" {
            return None;
        }
        let workflow = self.get(&name)?;
        Some(WorkflowMatch {
            workflow,
            confidence: parsed.value["confidence"].as_f64().unwrap_or(0.0),
            strategy: MatchStrategy::Semantic,
            captures: HashMap::new(),
        })
    }

    /// Token overlap between the command and the workflow's trigger/name
    /// vocabulary, scaled so it can clear the threshold only on strong
    /// overlap.
    fn match_keywords(&self, command: &str) -> Option<WorkflowMatch> {
        let command_tokens: Vec<String> = tokenize(command);
        if command_tokens.is_empty() {
            return None;
        }

        let workflows = self.workflows.read();
        let mut best: Option<(usize, f64)> = None;
        for (idx, workflow) in workflows.iter().enumerate() {
            let mut vocab: Vec<String> = tokenize(&workflow.name.replace('_', " "));
            vocab.extend(tokenize(&workflow.category));
            for trigger in &workflow.triggers {
                match trigger {
                    Trigger::Intent { intent } => vocab.extend(tokenize(&intent.replace('_', " "))),
                    Trigger::Pattern(p) => vocab.extend(
                        tokenize(p).into_iter().filter(|t| !t.starts_with('{')),
                    ),
                }
            }
            if vocab.is_empty() {
                continue;
            }
            let overlap = command_tokens
                .iter()
                .filter(|t| vocab.contains(t))
                .count();
            let score = 0.9 * overlap as f64 / command_tokens.len() as f64;
            if score > 0.0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((idx, score));
            }
        }

        best.map(|(idx, confidence)| WorkflowMatch {
            workflow: workflows[idx].clone(),
            confidence,
            strategy: MatchStrategy::Keyword,
            captures: HashMap::new(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pattern matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Match a glob-like trigger (`*` wildcards, `{name}` captures) against a
/// normalized command. Returns the captures on success.
fn match_pattern(pattern: &str, command: &str) -> Option<HashMap<String, String>> {
    let mut regex_src = String::from("^");
    let mut names = Vec::new();
    let mut rest = pattern.to_lowercase();

    while !rest.is_empty() {
        if let Some(open) = rest.find('{') {
            let (before, after) = rest.split_at(open);
            regex_src.push_str(&escape_glob(before));
            let close = after.find('}')?;
            let name = after[1..close].to_string();
            regex_src.push_str(&format!("(?P<c{}>.+?)", names.len()));
            names.push(name);
            rest = after[close + 1..].to_string();
        } else {
            regex_src.push_str(&escape_glob(&rest));
            rest.clear();
        }
    }
    regex_src.push('$');

    let re = regex::Regex::new(&regex_src).ok()?;
    let caps = re.captures(command)?;
    let mut out = HashMap::new();
    for (i, name) in names.iter().enumerate() {
        if let Some(m) = caps.name(&format!("c{i}")) {
            out.insert(name.clone(), m.as_str().trim().to_string());
        }
    }
    Some(out)
}

/// Escape regex metacharacters, turning glob `*` into `.*`.
fn escape_glob(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        match c {
            '*' => out.push_str(".*"),
            c if "\\.+?()[]|^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '{' && c != '}')
        .filter(|w| w.len() >= 2)
        .map(String::from)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(yaml: &[&str]) -> WorkflowRegistry {
        let registry = WorkflowRegistry::empty(0.7);
        let mut workflows = Vec::new();
        for src in yaml {
            workflows.push(serde_yaml::from_str::<Workflow>(src).unwrap());
        }
        *registry.workflows.write() = workflows;
        registry
    }

    const RESEARCH: &str = r#"
name: research_product
category: commerce research
triggers:
  - intent: research_product
  - "find me the cheapest {product}"
steps:
  - name: research
    tool: internet.research
    args:
      query: "{{product}}"
"#;

    const STATUS: &str = r#"
name: daily_status
category: reporting
triggers:
  - "show me today's status"
steps:
  - name: report
    tool: memory.lookup
"#;

    #[tokio::test]
    async fn exact_intent_wins_with_full_confidence() {
        let registry = registry_with(&[RESEARCH, STATUS]);
        let m = registry
            .find_match("whatever text", Some("research_product"))
            .await
            .unwrap();
        assert_eq!(m.strategy, MatchStrategy::ExactIntent);
        assert_eq!(m.confidence, 1.0);
        assert_eq!(m.workflow.name, "research_product");
    }

    #[tokio::test]
    async fn literal_phrase_matches_case_insensitively() {
        let registry = registry_with(&[RESEARCH, STATUS]);
        let m = registry
            .find_match("Show me today's STATUS", None)
            .await
            .unwrap();
        assert_eq!(m.strategy, MatchStrategy::LiteralPhrase);
        assert_eq!(m.workflow.name, "daily_status");
    }

    #[tokio::test]
    async fn pattern_captures_placeholder() {
        let registry = registry_with(&[RESEARCH, STATUS]);
        let m = registry
            .find_match("find me the cheapest laptop with nvidia gpu", None)
            .await
            .unwrap();
        assert_eq!(m.strategy, MatchStrategy::Pattern);
        assert_eq!(
            m.captures.get("product").map(String::as_str),
            Some("laptop with nvidia gpu")
        );
    }

    #[tokio::test]
    async fn no_match_below_threshold_returns_none() {
        let registry = registry_with(&[RESEARCH, STATUS]);
        assert!(registry
            .find_match("sing me a sea shanty", None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn keyword_fallback_on_strong_overlap() {
        let registry = registry_with(&[RESEARCH, STATUS]);
        // Shares "research" + "product" + "commerce" vocabulary.
        let m = registry.find_match("research product commerce", None).await;
        let m = m.expect("keyword overlap should match");
        assert_eq!(m.strategy, MatchStrategy::Keyword);
        assert!(m.confidence >= 0.7);
    }

    #[test]
    fn pattern_matcher_handles_globs() {
        let caps = match_pattern("deploy * to {env}", "deploy the api to staging").unwrap();
        assert_eq!(caps.get("env").map(String::as_str), Some("staging"));
        assert!(match_pattern("deploy * to {env}", "undeploy x").is_none());
    }

    #[test]
    fn reload_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("research.yaml"), RESEARCH).unwrap();
        let registry = WorkflowRegistry::load(tmp.path(), 0.7, None).unwrap();
        assert_eq!(registry.len(), 1);

        std::fs::write(tmp.path().join("status.yaml"), STATUS).unwrap();
        assert_eq!(registry.reload().unwrap(), 2);
        assert!(registry.get("daily_status").is_some());
    }
}
