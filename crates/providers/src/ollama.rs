use async_trait::async_trait;
use omni_core::{ChatMessage, Error, LLMResponse, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::client::build_http_client;
use crate::Provider;

const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";

/// Ollama native chat API (`POST /api/chat`, non-streaming).
pub struct OllamaProvider {
    client: Client,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(api_base: Option<&str>, model: &str, max_tokens: u32, temperature: f32) -> Self {
        Self::new_with_proxy(api_base, model, max_tokens, temperature, None, None, &[])
    }

    pub fn new_with_proxy(
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        provider_proxy: Option<&str>,
        global_proxy: Option<&str>,
        no_proxy: &[String],
    ) -> Self {
        let api_base = api_base
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_OLLAMA_BASE)
            .trim_end_matches('/')
            .to_string();
        // 本地推理较慢，HTTP 层超时放宽；网关另有自己的超时
        let client = build_http_client(
            provider_proxy,
            global_proxy,
            no_proxy,
            &api_base,
            Duration::from_secs(300),
        );
        Self {
            client,
            api_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    /// Config may store "ollama/qwen3" but the API expects "qwen3".
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("ollama/").unwrap_or(model)
    }

    fn build_request(&self, messages: &[ChatMessage]) -> OllamaChatRequest {
        OllamaChatRequest {
            model: Self::normalize_model(&self.model).to_string(),
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse> {
        let url = format!("{}/api/chat", self.api_base);
        let request = self.build_request(messages);
        debug!(url = %url, model = %request.model, messages = messages.len(), "🤖 [ollama] calling");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!(status = %status, body = %body, "🤖 [ollama] API error");
            return Err(Error::Provider(format!("Ollama API error {}: {}", status, body)));
        }

        let resp: OllamaChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Provider(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(LLMResponse {
            content: Some(resp.message.content).filter(|c| !c.is_empty()),
            reasoning_content: resp.message.thinking,
            finish_reason: resp.done_reason.unwrap_or_else(|| "stop".to_string()),
            usage: serde_json::json!({
                "prompt_tokens": resp.prompt_eval_count,
                "completion_tokens": resp.eval_count,
            }),
        })
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(OllamaProvider::normalize_model("ollama/qwen3"), "qwen3");
        assert_eq!(OllamaProvider::normalize_model("qwen2.5:7b"), "qwen2.5:7b");
    }

    #[test]
    fn test_request_shape() {
        let provider = OllamaProvider::new(Some("http://gpu:11434/"), "ollama/qwen3", 512, 0.1);
        assert_eq!(provider.api_base, "http://gpu:11434");
        let req = provider.build_request(&[ChatMessage::system("plan"), ChatMessage::user("greet")]);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["model"], "qwen3");
        assert_eq!(value["stream"], false);
        assert_eq!(value["options"]["num_predict"], 512);
        assert_eq!(value["messages"][1]["content"], "greet");
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "model": "qwen3",
            "message": { "role": "assistant", "content": "{\"CapabilityPurpose\": \"x\"}" },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 50,
            "eval_count": 20
        }"#;
        let resp: OllamaChatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.message.content.contains("CapabilityPurpose"));
        assert_eq!(resp.eval_count, Some(20));
        assert!(resp.message.thinking.is_none());
    }
}
