//! Stage recipes — the invocation contract for each LLM stage.
//!
//! A recipe names a role (a temperature/capacity tier), token budgets, the
//! expected output schema, and a prompt template path. Stages are looked up
//! by name in the recipe book; a missing recipe is a config error and halts
//! the turn.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A labeled (temperature, model-capacity) tier. The mapping from role to a
/// concrete model and temperature lives in `[llm.roles]` config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Fast, near-deterministic calls (search terms, turn summaries).
    Reflex,
    /// Balanced reasoning (planning, validation, reflection).
    Mind,
    /// Natural user-facing prose (synthesis).
    Voice,
    /// Compression (token-budget enforcement).
    Nerves,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reflex => "reflex",
            Role::Mind => "mind",
            Role::Voice => "voice",
            Role::Nerves => "nerves",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every named LLM invocation point in the pipeline.
///
/// `Retrieve` itself is not an LLM stage; its search-term generation call is
/// `SearchTerms`. `Compression` is the budget-enforcement helper invoked
/// before any over-budget stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Analyze,
    ValidateAnalysis,
    SearchTerms,
    SynthesizeContext,
    ValidateContext,
    Plan,
    Executor,
    Coordinator,
    Synthesize,
    Validate,
    TurnSummary,
    Compression,
    Reflect,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Analyze => "analyze",
            StageName::ValidateAnalysis => "validate_analysis",
            StageName::SearchTerms => "search_terms",
            StageName::SynthesizeContext => "synthesize_context",
            StageName::ValidateContext => "validate_context",
            StageName::Plan => "plan",
            StageName::Executor => "executor",
            StageName::Coordinator => "coordinator",
            StageName::Synthesize => "synthesize",
            StageName::Validate => "validate",
            StageName::TurnSummary => "turn_summary",
            StageName::Compression => "compression",
            StageName::Reflect => "reflect",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recipe
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The invocation contract for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub role: Role,
    /// Overrides the role's configured temperature when set.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Input budget in tokens; over-budget prompts go through compression.
    pub max_tokens_in: u32,
    /// Output cap passed to the LLM endpoint.
    pub max_tokens_out: u32,
    /// Name of the expected output schema (keys the forgiving parser).
    pub schema_name: String,
    /// Prompt template path, relative to the prompts directory.
    pub prompt_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_serde() {
        for role in [Role::Reflex, Role::Mind, Role::Voice, Role::Nerves] {
            let s = serde_json::to_string(&role).unwrap();
            let back: Role = serde_json::from_str(&s).unwrap();
            assert_eq!(role, back);
        }
    }

    #[test]
    fn stage_name_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageName::ValidateAnalysis).unwrap(),
            "\"validate_analysis\""
        );
        assert_eq!(StageName::SynthesizeContext.to_string(), "synthesize_context");
    }

    #[test]
    fn recipe_deserializes_with_optional_temperature() {
        let json = r#"{
            "role": "mind",
            "max_tokens_in": 6000,
            "max_tokens_out": 1200,
            "schema_name": "strategic_plan",
            "prompt_path": "plan.md"
        }"#;
        let r: Recipe = serde_json::from_str(json).unwrap();
        assert_eq!(r.role, Role::Mind);
        assert!(r.temperature.is_none());
    }
}
