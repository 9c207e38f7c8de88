pub mod client;
pub mod factory;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use omni_core::{ChatMessage, LLMResponse, Result};

/// A concrete language-model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, messages: &[ChatMessage]) -> Result<LLMResponse>;
}

pub use factory::create_provider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
