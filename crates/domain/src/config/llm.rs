use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::recipe::Role;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound LLM endpoint (OpenAI-compatible chat completions) plus the
/// role table mapping REFLEX/MIND/VOICE/NERVES to concrete model and
/// temperature.
///
/// `LLM_URL`, `LLM_API_KEY`, and `LLM_MODEL` override `base_url`,
/// `api_key`, and `model` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Bearer token. Empty string = unauthenticated endpoint (local).
    #[serde(default)]
    pub api_key: String,
    /// Default model when a role does not name its own.
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_timeout")]
    pub timeout_secs: u64,
    /// Embedding endpoint model; same base URL.
    #[serde(default = "d_embed_model")]
    pub embedding_model: String,
    /// Expected embedding width.
    #[serde(default = "d_embed_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_roles")]
    pub roles: HashMap<Role, RoleConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key: String::new(),
            model: d_model(),
            timeout_secs: d_timeout(),
            embedding_model: d_embed_model(),
            embedding_dims: d_embed_dims(),
            roles: default_roles(),
        }
    }
}

impl LlmConfig {
    /// Resolve the (model, temperature) pair for a role. Falls back to the
    /// default model and the role's canonical temperature when unconfigured.
    pub fn role_params(&self, role: Role) -> (String, f32) {
        match self.roles.get(&role) {
            Some(rc) => (
                rc.model.clone().unwrap_or_else(|| self.model.clone()),
                rc.temperature,
            ),
            None => (self.model.clone(), canonical_temperature(role)),
        }
    }
}

/// Per-role model/temperature override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Concrete model name; `None` uses the endpoint default.
    #[serde(default)]
    pub model: Option<String>,
    pub temperature: f32,
}

fn canonical_temperature(role: Role) -> f32 {
    match role {
        Role::Reflex => 0.3,
        Role::Mind => 0.5,
        Role::Voice => 0.7,
        Role::Nerves => 0.3,
    }
}

fn default_roles() -> HashMap<Role, RoleConfig> {
    let mut roles = HashMap::new();
    for role in [Role::Reflex, Role::Mind, Role::Voice, Role::Nerves] {
        roles.insert(
            role,
            RoleConfig {
                model: None,
                temperature: canonical_temperature(role),
            },
        );
    }
    roles
}

fn d_base_url() -> String {
    "http://localhost:8000".into()
}
fn d_model() -> String {
    "default".into()
}
fn d_timeout() -> u64 {
    120
}
fn d_embed_model() -> String {
    "embedding-default".into()
}
fn d_embed_dims() -> usize {
    384
}
