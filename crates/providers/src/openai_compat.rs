//! OpenAI-compatible adapter.
//!
//! Works with any endpoint that follows the OpenAI chat completions and
//! embeddings contracts (`/v1/chat/completions`, `/v1/embeddings`) with
//! bearer auth.

use cox_domain::config::LlmConfig;
use cox_domain::error::{Error, Result};
use serde_json::Value;

use crate::traits::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider, MsgRole, Usage,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    embedding_model: String,
    embedding_dims: usize,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Llm(format!("http client: {e}")))?;

        Ok(Self {
            id: "openai-compat".into(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            default_model: cfg.model.clone(),
            embedding_model: cfg.embedding_model.clone(),
            embedding_dims: cfg.embedding_dims,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        builder
    }

    fn build_chat_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": match m.role {
                        MsgRole::System => "system",
                        MsgRole::User => "user",
                        MsgRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();

        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_chat_body(&req);

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Llm(format!("chat timeout: {e}"))
                } else {
                    Error::Llm(format!("chat transport: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("chat HTTP {status}: {text}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Llm(format!("chat body: {e}")))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            return Err(Error::Llm("empty completion".into()));
        }

        let usage = json.get("usage").map(parse_usage);
        let model = json["model"]
            .as_str()
            .unwrap_or(&self.default_model)
            .to_string();
        let finish_reason = json["choices"][0]["finish_reason"]
            .as_str()
            .map(String::from);

        Ok(ChatResponse {
            content,
            usage,
            model,
            finish_reason,
        })
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.embedding_model.clone());
        let body = serde_json::json!({
            "model": model,
            "input": req.input,
        });

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("embeddings transport: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("embeddings HTTP {status}: {text}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Llm(format!("embeddings body: {e}")))?;

        let mut embeddings = Vec::new();
        if let Some(rows) = json["data"].as_array() {
            for row in rows {
                let vector: Vec<f32> = row["embedding"]
                    .as_array()
                    .map(|xs| {
                        xs.iter()
                            .filter_map(|x| x.as_f64())
                            .map(|x| x as f32)
                            .collect()
                    })
                    .unwrap_or_default();
                if vector.len() != self.embedding_dims {
                    tracing::warn!(
                        got = vector.len(),
                        expected = self.embedding_dims,
                        "embedding width differs from configured dims"
                    );
                }
                embeddings.push(vector);
            }
        }
        if embeddings.len() != req.input.len() {
            return Err(Error::Llm(format!(
                "embeddings count mismatch: {} inputs, {} vectors",
                req.input.len(),
                embeddings.len()
            )));
        }

        Ok(EmbeddingsResponse { embeddings })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

fn parse_usage(v: &Value) -> Usage {
    Usage {
        prompt_tokens: v["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: v["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: v["total_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatMessage;

    fn provider() -> OpenAiCompatProvider {
        let cfg = LlmConfig {
            base_url: "http://llm.internal:8000/".into(),
            api_key: "sk-test".into(),
            model: "brain-large".into(),
            ..LlmConfig::default()
        };
        OpenAiCompatProvider::from_config(&cfg).unwrap()
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let p = provider();
        assert_eq!(p.base_url, "http://llm.internal:8000");
    }

    #[test]
    fn chat_body_includes_model_and_params() {
        let p = provider();
        let req = ChatRequest {
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            model: None,
            temperature: Some(0.3),
            max_tokens: Some(400),
        };
        let body = p.build_chat_body(&req);
        assert_eq!(body["model"], "brain-large");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 400);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn chat_body_honors_model_override() {
        let p = provider();
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: Some("reflex-small".into()),
            ..ChatRequest::default()
        };
        assert_eq!(p.build_chat_body(&req)["model"], "reflex-small");
    }

    #[test]
    fn usage_parses_from_wire_shape() {
        let v = serde_json::json!({
            "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150
        });
        let u = parse_usage(&v);
        assert_eq!(u.prompt_tokens, 120);
        assert_eq!(u.total_tokens, 150);
    }
}
