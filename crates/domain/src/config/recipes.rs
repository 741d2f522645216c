use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::recipe::{Recipe, Role, StageName};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recipe book
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All stage recipes, keyed by stage name. Ships with a complete default
/// set; deployments override individual stages in the config file. A stage
/// with no recipe is a config error at invocation time (fail-fast).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipesConfig {
    /// Directory holding prompt templates referenced by `prompt_path`.
    #[serde(default = "d_prompts_dir")]
    pub prompts_dir: String,
    /// Stage overrides merge over the default set, so a config file only
    /// names the stages it changes.
    #[serde(default = "default_recipes", deserialize_with = "merge_over_defaults")]
    pub stages: HashMap<StageName, Recipe>,
}

fn merge_over_defaults<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<StageName, Recipe>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<StageName, Recipe>::deserialize(deserializer)?;
    let mut merged = default_recipes();
    merged.extend(overrides);
    Ok(merged)
}

impl Default for RecipesConfig {
    fn default() -> Self {
        Self {
            prompts_dir: d_prompts_dir(),
            stages: default_recipes(),
        }
    }
}

impl RecipesConfig {
    pub fn recipe_for(&self, stage: StageName) -> Result<&Recipe> {
        self.stages
            .get(&stage)
            .ok_or_else(|| Error::Config(format!("no recipe for stage {stage}")))
    }
}

fn d_prompts_dir() -> String {
    "prompts".into()
}

fn recipe(
    role: Role,
    max_tokens_in: u32,
    max_tokens_out: u32,
    schema_name: &str,
    prompt_path: &str,
) -> Recipe {
    Recipe {
        role,
        temperature: None,
        max_tokens_in,
        max_tokens_out,
        schema_name: schema_name.into(),
        prompt_path: prompt_path.into(),
    }
}

fn default_recipes() -> HashMap<StageName, Recipe> {
    use StageName::*;
    let mut m = HashMap::new();
    m.insert(Analyze, recipe(Role::Mind, 4_000, 800, "query_analysis", "analyze.md"));
    m.insert(
        ValidateAnalysis,
        recipe(Role::Reflex, 2_000, 400, "helper_verdict", "validate_analysis.md"),
    );
    m.insert(SearchTerms, recipe(Role::Reflex, 1_500, 300, "search_terms", "search_terms.md"));
    m.insert(
        SynthesizeContext,
        recipe(Role::Mind, 8_000, 1_500, "context_synthesis", "synthesize_context.md"),
    );
    m.insert(
        ValidateContext,
        recipe(Role::Reflex, 3_000, 400, "helper_verdict", "validate_context.md"),
    );
    m.insert(Plan, recipe(Role::Mind, 6_000, 1_200, "strategic_plan", "plan.md"));
    m.insert(Executor, recipe(Role::Mind, 8_000, 1_000, "executor_action", "executor.md"));
    m.insert(
        Coordinator,
        recipe(Role::Reflex, 3_000, 600, "coordinator_translation", "coordinator.md"),
    );
    m.insert(Synthesize, recipe(Role::Voice, 10_000, 2_000, "synthesis", "synthesize.md"));
    m.insert(Validate, recipe(Role::Mind, 8_000, 800, "final_validation", "validate.md"));
    m.insert(TurnSummary, recipe(Role::Reflex, 4_000, 400, "turn_summary", "turn_summary.md"));
    m.insert(Compression, recipe(Role::Nerves, 12_000, 2_000, "compression", "compress.md"));
    m.insert(Reflect, recipe(Role::Mind, 10_000, 1_200, "reflection", "reflect.md"));
    m
}
