use omni_core::{Config, Error, Result};
use std::sync::Arc;
use tracing::info;

use crate::{OllamaProvider, OpenAIProvider, Provider};

/// 默认的 OpenAI 兼容 provider 的 api_base
fn default_api_base(provider_name: &str) -> &'static str {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "kimi" | "moonshot" => "https://api.moonshot.cn/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Build the provider selected by `agent.provider`.
pub fn create_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let (name, provider_config) = config.active_provider();
    let agent = &config.agent;
    let global_proxy = config.network.proxy.as_deref();
    let no_proxy = &config.network.no_proxy;

    let provider: Arc<dyn Provider> = if name == "ollama" {
        Arc::new(OllamaProvider::new_with_proxy(
            provider_config.api_base.as_deref(),
            &agent.model,
            agent.max_tokens,
            agent.temperature,
            provider_config.proxy.as_deref(),
            global_proxy,
            no_proxy,
        ))
    } else {
        if provider_config.api_key.trim().is_empty() {
            return Err(Error::Config(format!(
                "provider '{}' has no apiKey configured",
                name
            )));
        }
        let api_base = provider_config
            .api_base
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| default_api_base(&name).to_string());
        Arc::new(OpenAIProvider::new_with_proxy(
            &name,
            &provider_config.api_key,
            &api_base,
            &agent.model,
            agent.max_tokens,
            agent.temperature,
            provider_config.proxy.as_deref(),
            global_proxy,
            no_proxy,
        ))
    };

    info!(provider = %name, model = %agent.model, "🤖 [provider] created");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_ollama() {
        let provider = create_provider(&Config::default()).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn test_openai_requires_key() {
        let mut config = Config::default();
        config.agent.provider = "openai".to_string();
        assert!(matches!(create_provider(&config), Err(Error::Config(_))));

        if let Some(p) = config.providers.get_mut("openai") {
            p.api_key = "sk-test".to_string();
        }
        assert_eq!(create_provider(&config).unwrap().name(), "openai");
    }

    #[test]
    fn test_unknown_compatible_provider_gets_default_base() {
        let mut config = Config::default();
        config.agent.provider = "deepseek".to_string();
        config.providers.insert(
            "deepseek".to_string(),
            omni_core::config::ProviderConfig {
                api_key: "k".to_string(),
                api_base: None,
                proxy: None,
            },
        );
        assert_eq!(create_provider(&config).unwrap().name(), "deepseek");
        assert_eq!(default_api_base("deepseek"), "https://api.deepseek.com/v1");
    }
}
