//! Role routing — resolves a REFLEX/MIND/VOICE/NERVES label to a concrete
//! (model, temperature) pair and dispatches to the shared provider.

use std::sync::Arc;

use cox_domain::config::LlmConfig;
use cox_domain::error::Result;
use cox_domain::recipe::Role;

use crate::traits::{
    ChatMessage, ChatRequest, ChatResponse, EmbeddingsRequest, LlmProvider,
};

/// Dispatches role-labeled calls to the underlying provider. This is the
/// object the orchestrator holds; tests construct one around a scripted
/// fake provider.
pub struct RoleRouter {
    provider: Arc<dyn LlmProvider>,
    cfg: LlmConfig,
}

impl RoleRouter {
    pub fn new(provider: Arc<dyn LlmProvider>, cfg: LlmConfig) -> Self {
        Self { provider, cfg }
    }

    /// Resolve the (model, temperature) pair for a role.
    pub fn params(&self, role: Role) -> (String, f32) {
        self.cfg.role_params(role)
    }

    /// Issue a chat call as the given role. `temperature` overrides the
    /// role's configured value when set (recipes may pin one).
    pub async fn chat_as(
        &self,
        role: Role,
        messages: Vec<ChatMessage>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<ChatResponse> {
        let (model, role_temp) = self.params(role);
        let req = ChatRequest {
            messages,
            model: Some(model),
            temperature: Some(temperature.unwrap_or(role_temp)),
            max_tokens,
        };
        self.provider.chat(req).await
    }

    /// Embed a batch of texts with the configured embedding model.
    pub async fn embed(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .provider
            .embeddings(EmbeddingsRequest { input, model: None })
            .await?;
        Ok(resp.embeddings)
    }

    pub fn provider(&self) -> Arc<dyn LlmProvider> {
        self.provider.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use cox_domain::error::Error;

    use crate::traits::{EmbeddingsResponse, Usage};

    struct EchoProvider {
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for EchoProvider {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
            let model = req.model.clone().unwrap_or_default();
            self.seen.lock().unwrap().push(req);
            Ok(ChatResponse {
                content: "ok".into(),
                usage: Some(Usage::default()),
                model,
                finish_reason: Some("stop".into()),
            })
        }

        async fn embeddings(
            &self,
            req: crate::traits::EmbeddingsRequest,
        ) -> Result<EmbeddingsResponse> {
            if req.input.is_empty() {
                return Err(Error::Llm("no input".into()));
            }
            Ok(EmbeddingsResponse {
                embeddings: req.input.iter().map(|_| vec![0.0; 4]).collect(),
            })
        }

        fn provider_id(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn chat_as_applies_role_temperature() {
        let provider = Arc::new(EchoProvider {
            seen: Mutex::new(Vec::new()),
        });
        let router = RoleRouter::new(provider.clone(), LlmConfig::default());

        router
            .chat_as(Role::Voice, vec![ChatMessage::user("hi")], Some(100), None)
            .await
            .unwrap();

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!((seen[0].temperature.unwrap() - 0.7).abs() < f32::EPSILON);
        assert_eq!(seen[0].max_tokens, Some(100));
    }

    #[tokio::test]
    async fn recipe_temperature_overrides_role_default() {
        let provider = Arc::new(EchoProvider {
            seen: Mutex::new(Vec::new()),
        });
        let router = RoleRouter::new(provider.clone(), LlmConfig::default());

        router
            .chat_as(Role::Mind, vec![ChatMessage::user("hi")], None, Some(0.55))
            .await
            .unwrap();

        let seen = provider.seen.lock().unwrap();
        assert!((seen[0].temperature.unwrap() - 0.55).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn embed_returns_one_vector_per_input() {
        let provider = Arc::new(EchoProvider {
            seen: Mutex::new(Vec::new()),
        });
        let router = RoleRouter::new(provider, LlmConfig::default());
        let vectors = router
            .embed(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
    }
}
