use async_trait::async_trait;
use omni_core::{ChatMessage, Error, LLMResponse, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::client::build_http_client;
use crate::Provider;

/// Largest byte index `<= max_bytes` that lies on a char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if s.len() <= max_bytes {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAIProvider {
    client: Client,
    name: String,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(
        name: &str,
        api_key: &str,
        api_base: &str,
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self::new_with_proxy(name, api_key, api_base, model, max_tokens, temperature, None, None, &[])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_proxy(
        name: &str,
        api_key: &str,
        api_base: &str,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        provider_proxy: Option<&str>,
        global_proxy: Option<&str>,
        no_proxy: &[String],
    ) -> Self {
        let api_base = api_base.trim_end_matches('/').to_string();
        let client = build_http_client(
            provider_proxy,
            global_proxy,
            no_proxy,
            &api_base,
            Duration::from_secs(120),
        );
        Self {
            client,
            name: name.to_string(),
            api_key: api_key.to_string(),
            api_base,
            // "openai/gpt-4o" → "gpt-4o"
            model: model
                .split_once('/')
                .filter(|(prefix, _)| *prefix == name)
                .map(|(_, m)| m.to_string())
                .unwrap_or_else(|| model.to_string()),
            max_tokens,
            temperature,
        }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        debug!(url = %url, model = %self.model, messages = messages.len(), "🤖 [openai] calling");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = %status, body = %raw_body, "🤖 [openai] API error");
            return Err(Error::Provider(format!("API error {}: {}", status, raw_body)));
        }

        let parsed: ChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 500);
            Error::Provider(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;

        Ok(LLMResponse {
            content: choice.message.content,
            reasoning_content: choice.message.reasoning_content,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: parsed.usage.unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}
