//! Tool service transport.
//!
//! One HTTP POST per invocation: `{base}/{tool_name}` with JSON args and
//! the mode header. No retries or internal timeouts at this layer — tools
//! own their internal loops.

use async_trait::async_trait;
use serde_json::Value;

use cox_domain::error::{Error, Result};
use cox_domain::turn::Mode;

pub const MODE_HEADER: &str = "X-Pandora-Mode";

/// The seam between the executor and the tool service. Tests install a
/// scripted implementation.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(&self, tool: &str, args: &Value, mode: Mode) -> Result<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpToolTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpToolTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Tool {
                tool: "transport".into(),
                message: format!("http client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url_for(&self, tool: &str) -> String {
        format!("{}/{}", self.base_url, tool)
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn invoke(&self, tool: &str, args: &Value, mode: Mode) -> Result<Value> {
        let url = self.url_for(tool);
        tracing::debug!(tool, %url, mode = mode.as_str(), "invoking tool");

        let resp = self
            .client
            .post(&url)
            .header(MODE_HEADER, mode.as_str())
            .json(args)
            .send()
            .await
            .map_err(|e| Error::Tool {
                tool: tool.to_string(),
                message: format!("transport: {e}"),
            })?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Error::Tool {
                tool: tool.to_string(),
                message: format!("HTTP {status}: {body}"),
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_composition_trims_slash() {
        let t = HttpToolTransport::new("http://tools.internal:8100/").unwrap();
        assert_eq!(
            t.url_for("internet.research"),
            "http://tools.internal:8100/internet.research"
        );
    }

    #[test]
    fn mode_header_name_is_fixed() {
        assert_eq!(MODE_HEADER, "X-Pandora-Mode");
    }
}
