// =============================================================================
// LlmClient — chat-completion HTTP client
// =============================================================================
//
// Request shape: `{model, messages:[{role, content}, ...], temperature,
// max_tokens, response_format:{type:"json_object"}}`. The response is parsed
// as strict JSON — both the outer chat-completion envelope and the model's
// `content` string, which must itself be a JSON object per
// `response_format`. The model name is configurable; this client makes no
// assumption about which provider sits behind `base_url`.
//
// Shape follows `exchange::client::ExchangeClient`: a reqwest client held
// in a struct, typed async methods, `#[instrument(skip(self))]`,
// `anyhow::Context`, and a `Debug` impl that redacts the key.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const DEFAULT_TEMPERATURE: f64 = 0.3;
const DEFAULT_MAX_TOKENS: u32 = 600;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Thin HTTP client for a chat-completion endpoint. Cheap to clone (holds an
/// `Arc`-backed `reqwest::Client` internally); callers typically share one
/// instance across every agent and the coordinator.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Send a chat-completion request and parse the model's `content` field
    /// as a strict JSON object. `timeout` is the caller's responsibility to
    /// pick.
    #[instrument(skip(self, messages), fields(model = %self.model))]
    pub async fn chat_json(&self, messages: &[ChatMessage], timeout: Duration) -> Result<serde_json::Value> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .context("language-model request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("language-model endpoint returned {status}: {body}");
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .context("failed to parse chat-completion envelope")?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .context("chat-completion response had no choices")?
            .message
            .content;

        let value: serde_json::Value = serde_json::from_str(&content).with_context(|| {
            format!("model content was not valid JSON: {content}")
        })?;

        debug!("language-model response parsed");
        Ok(value)
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let client = LlmClient::new("sk-secret", "https://example.invalid/v1", "gpt-4o");
        let s = format!("{client:?}");
        assert!(!s.contains("sk-secret"));
        assert!(s.contains("<redacted>"));
    }

    #[test]
    fn chat_message_constructors_set_role() {
        let sys = ChatMessage::system("be terse");
        assert_eq!(sys.role, "system");
        let usr = ChatMessage::user("hello");
        assert_eq!(usr.role, "user");
    }
}
