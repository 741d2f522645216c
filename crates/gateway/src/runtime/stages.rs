//! Stage runner — one named LLM invocation per call.
//!
//! Looks up the stage's recipe, assembles the composed prompt (system +
//! recipe body + selected document sections), enforces the input token
//! budget via compression and section dropping, calls the endpoint, and
//! runs the forgiving parser. The §0 query section is never compressed or
//! dropped.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use cox_domain::config::RecipesConfig;
use cox_domain::error::Result;
use cox_domain::recipe::StageName;
use cox_providers::parse::{parse_stage_output, ParseStrategy, SchemaSpec};
use cox_providers::{ChatMessage, RoleRouter};
use cox_store::StageMetric;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One block of context handed to a stage. Lower priority numbers are
/// more important; priority 0 is protected (never compressed or dropped).
#[derive(Debug, Clone)]
pub struct PromptSection {
    pub title: String,
    pub content: String,
    pub priority: u8,
    /// Average confidence of the section's sources; low-confidence
    /// sections compress first.
    pub confidence: f64,
    /// Larger = more recent. Least-recent sections compress first.
    pub recency: u32,
}

impl PromptSection {
    pub fn protected(title: &str, content: &str) -> Self {
        Self {
            title: title.to_string(),
            content: content.to_string(),
            priority: 0,
            confidence: 1.0,
            recency: u32::MAX,
        }
    }

    pub fn new(title: &str, content: &str, priority: u8, confidence: f64, recency: u32) -> Self {
        Self {
            title: title.to_string(),
            content: content.to_string(),
            priority,
            confidence,
            recency,
        }
    }
}

/// Crude token estimate (chars / 4), adequate for budget enforcement.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub value: Value,
    pub strategy: ParseStrategy,
    pub metric: StageMetric,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StageRunner {
    router: Arc<RoleRouter>,
    recipes: RecipesConfig,
}

impl StageRunner {
    pub fn new(router: Arc<RoleRouter>, recipes: RecipesConfig) -> Self {
        Self { router, recipes }
    }

    pub fn router(&self) -> Arc<RoleRouter> {
        self.router.clone()
    }

    /// Run one stage: budget, compose, call, parse.
    pub async fn run_stage(
        &self,
        stage: StageName,
        sections: &[PromptSection],
        input: &str,
        schema: &SchemaSpec,
    ) -> Result<StageOutput> {
        let recipe = self.recipes.recipe_for(stage)?.clone();
        let started = Instant::now();

        let sections = self
            .enforce_budget(stage, sections, input, recipe.max_tokens_in)
            .await?;

        let system = self.load_prompt(&recipe.prompt_path, stage);
        let mut body = String::new();
        for section in &sections {
            body.push_str(&format!("## {}\n{}\n\n", section.title, section.content));
        }
        body.push_str(input);

        let messages = vec![ChatMessage::system(system), ChatMessage::user(body)];
        let response = self
            .router
            .chat_as(recipe.role, messages, Some(recipe.max_tokens_out), recipe.temperature)
            .await?;

        let parsed = parse_stage_output(&response.content, schema)?;
        let usage = response.usage.unwrap_or_default();
        let metric = StageMetric {
            stage: stage.as_str().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            parse_strategy: Some(parsed.strategy.as_str().to_string()),
        };
        tracing::debug!(
            stage = %stage,
            strategy = parsed.strategy.as_str(),
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            "stage complete"
        );

        Ok(StageOutput {
            value: parsed.value,
            strategy: parsed.strategy,
            metric,
        })
    }

    // ── Budget enforcement ────────────────────────────────────────

    /// Compress least-recent / lowest-confidence sections first, then drop
    /// low-priority sections. Protected sections pass through untouched.
    async fn enforce_budget(
        &self,
        stage: StageName,
        sections: &[PromptSection],
        input: &str,
        budget: u32,
    ) -> Result<Vec<PromptSection>> {
        let mut sections: Vec<PromptSection> = sections.to_vec();
        let total = |sections: &[PromptSection]| -> u32 {
            estimate_tokens(input)
                + sections
                    .iter()
                    .map(|s| estimate_tokens(&s.content))
                    .sum::<u32>()
        };

        if total(&sections) <= budget {
            return Ok(sections);
        }
        tracing::info!(
            stage = %stage,
            estimated = total(&sections),
            budget,
            "prompt over budget; compressing"
        );

        // Compression order: least recent first, lowest confidence first.
        let mut order: Vec<usize> = (0..sections.len())
            .filter(|&i| sections[i].priority > 0)
            .collect();
        order.sort_by(|&a, &b| {
            sections[a]
                .recency
                .cmp(&sections[b].recency)
                .then_with(|| {
                    sections[a]
                        .confidence
                        .partial_cmp(&sections[b].confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        for &idx in &order {
            if total(&sections) <= budget {
                return Ok(sections);
            }
            if let Some(compressed) = self.compress(&sections[idx]).await {
                sections[idx].content = compressed;
            }
        }

        // Still over: drop lowest-priority sections (highest number first).
        while total(&sections) > budget {
            let Some(drop_idx) = sections
                .iter()
                .enumerate()
                .filter(|(_, s)| s.priority > 0)
                .max_by_key(|(_, s)| s.priority)
                .map(|(i, _)| i)
            else {
                break;
            };
            tracing::info!(
                stage = %stage,
                section = %sections[drop_idx].title,
                "dropping section to meet token budget"
            );
            sections.remove(drop_idx);
        }

        Ok(sections)
    }

    /// One NERVES compression call for a section; `None` keeps the
    /// original (compression is best-effort, dropping is the backstop).
    async fn compress(&self, section: &PromptSection) -> Option<String> {
        let recipe = self.recipes.recipe_for(StageName::Compression).ok()?.clone();
        let messages = vec![
            ChatMessage::system(self.load_prompt(&recipe.prompt_path, StageName::Compression)),
            ChatMessage::user(format!(
                "Compress this context section to its essential facts:\n\n## {}\n{}",
                section.title, section.content
            )),
        ];
        match self
            .router
            .chat_as(recipe.role, messages, Some(recipe.max_tokens_out), recipe.temperature)
            .await
        {
            Ok(resp) if !resp.content.trim().is_empty() => Some(resp.content),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, section = %section.title, "compression call failed");
                None
            }
        }
    }

    fn load_prompt(&self, prompt_path: &str, stage: StageName) -> String {
        let path = std::path::Path::new(&self.recipes.prompts_dir).join(prompt_path);
        match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => default_prompt(stage).to_string(),
        }
    }
}

/// Built-in prompts used when no template file is deployed. Terse by
/// intent: deployments override via the prompts directory.
fn default_prompt(stage: StageName) -> &'static str {
    match stage {
        StageName::Analyze => {
            "Analyze the user query. Reply as JSON: {\"user_purpose\": str, \
             \"data_requirements\": {\"needs_current_prices\": bool, \"needs_availability\": bool, \
             \"needs_web_research\": bool}, \"referenced_turns\": [int], \"topic\": str, \
             \"keywords\": [str]}"
        }
        StageName::ValidateAnalysis | StageName::ValidateContext => {
            "Validate the preceding stage output. Reply as JSON: {\"decision\": \
             \"pass\"|\"retry\"|\"clarify\", \"issues\": [str], \"retry_guidance\": [str], \
             \"clarification\": str|null}"
        }
        StageName::SearchTerms => {
            "Produce 3-5 short memory search terms. Reply as JSON: {\"search_terms\": [str], \
             \"include_preferences\": bool, \"include_n_minus_1\": bool}"
        }
        StageName::SynthesizeContext => {
            "Organize the retrieved context for answering the query. Reply as JSON: \
             {\"summary\": str, \"gaps\": [str]}"
        }
        StageName::Plan => {
            "Produce a strategic plan. Reply as JSON: {\"route\": \
             \"executor\"|\"synthesis\"|\"clarify\"|\"refresh_context\", \"goals\": [{\"id\": str, \
             \"description\": str, \"priority\": int, \"depends_on\": [str]}], \"approach\": str, \
             \"success_criteria\": [str], \"clarification\": str|null, \"missing_items\": [str]}"
        }
        StageName::Executor => {
            "Decide the next tactical step. Reply as JSON: {\"action\": \
             \"COMMAND\"|\"ANALYZE\"|\"COMPLETE\"|\"BLOCKED\", \"command\": str|null, \
             \"analysis\": str|null, \"reason\": str|null}"
        }
        StageName::Coordinator => {
            "Translate the command into one tool invocation. Reply as JSON: {\"tool\": str|null, \
             \"args\": object, \"intent\": str|null}"
        }
        StageName::Synthesize => {
            "Write the user-facing response from the gathered evidence. Reply as JSON: \
             {\"response\": str, \"checklist\": [str]}"
        }
        StageName::Validate => {
            "Validate the response. Reply as JSON: {\"decision\": \
             \"APPROVE\"|\"REVISE\"|\"RETRY\"|\"FAIL\", \"confidence\": number, \"checks\": object, \
             \"revision_hints\": [str], \"suggested_fixes\": [str]}"
        }
        StageName::TurnSummary => {
            "Summarize this turn for future recall. Reply as JSON: {\"summary\": str, \
             \"topic\": str, \"keywords\": [str], \"content_type\": str}"
        }
        StageName::Compression => "Compress the given section, keeping every concrete fact.",
        StageName::Reflect => {
            "Distill durable knowledge from these turns. Reply as JSON: {\"new_facts\": \
             [{\"content\": str, \"source_turns\": [str], \"content_type\": str}], \"corrections\": \
             [{\"content\": str, \"target\": str, \"source_turns\": [str]}], \"connections\": \
             [{\"content\": str, \"source_turns\": [str]}], \"open_questions\": [str]}"
        }
    }
}
