use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    /// provider 级别代理：Some("") 表示强制直连
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_agent_name() -> String {
    "omni".to_string()
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_model() -> String {
    "qwen3".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            provider: default_provider(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Retry/timeout budget for every language-model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 输出形状不合法时是否在预算内重试
    #[serde(default = "default_retry_malformed")]
    pub retry_malformed: bool,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    8000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_retry_malformed() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            retry_malformed: default_retry_malformed(),
        }
    }
}

/// What happens when a second `add` arrives for a name that is already in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// 关闭时流程停在 PLANNED（代码生成仍是占位实现）
    #[serde(default)]
    pub synthesis_enabled: bool,
    #[serde(default = "default_max_function_retries")]
    pub max_function_retries: u32,
    #[serde(default = "default_max_synthesis_rounds")]
    pub max_synthesis_rounds: u32,
    #[serde(default)]
    pub lock_policy: LockPolicy,
}

fn default_max_function_retries() -> u32 {
    2
}

fn default_max_synthesis_rounds() -> u32 {
    2
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            synthesis_enabled: false,
            max_function_retries: default_max_function_retries(),
            max_synthesis_rounds: default_max_synthesis_rounds(),
            lock_policy: LockPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
}

fn default_max_operations() -> u64 {
    100_000
}

fn default_sandbox_timeout_ms() -> u64 {
    5_000
}

fn default_max_string_size() -> usize {
    1_000_000
}

fn default_max_collection_size() -> usize {
    10_000
}

fn default_max_call_depth() -> usize {
    64
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            timeout_ms: default_sandbox_timeout_ms(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
            max_call_depth: default_max_call_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();
    providers.insert("ollama".to_string(), ProviderConfig {
        api_key: String::new(),
        api_base: Some("http://localhost:11434".to_string()),
        proxy: None,
    });
    providers.insert("openai".to_string(), ProviderConfig {
        api_key: String::new(),
        api_base: Some("https://api.openai.com/v1".to_string()),
        proxy: None,
    });
    providers
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            agent: AgentConfig::default(),
            gateway: GatewayConfig::default(),
            pipeline: PipelineConfig::default(),
            sandbox: SandboxConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.max_attempts == 0 {
            return Err(Error::Config("gateway.maxAttempts must be at least 1".to_string()));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(Error::Config("gateway.timeoutSecs must be positive".to_string()));
        }
        if self.agent.model.trim().is_empty() {
            return Err(Error::Config("agent.model must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// The provider selected by `agent.provider`, falling back to defaults for known names.
    pub fn active_provider(&self) -> (String, ProviderConfig) {
        let name = self.agent.provider.clone();
        let config = self
            .providers
            .get(&name)
            .cloned()
            .or_else(|| default_providers().remove(&name))
            .unwrap_or_default();
        (name, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.agent.provider, "ollama");
        assert_eq!(cfg.agent.model, "qwen3");
        assert_eq!(cfg.gateway.max_attempts, 2);
        assert!(!cfg.pipeline.synthesis_enabled);
        assert_eq!(cfg.pipeline.lock_policy, LockPolicy::Reject);
        assert!(cfg.providers.contains_key("ollama"));
    }

    #[test]
    fn test_camel_case_overrides() {
        let raw = r#"{
  "agent": { "provider": "openai", "model": "gpt-4o-mini" },
  "gateway": { "maxAttempts": 5, "timeoutSecs": 10 },
  "pipeline": { "synthesisEnabled": true, "lockPolicy": "queue" }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.gateway.max_attempts, 5);
        assert_eq!(cfg.gateway.retry_delay_ms, 500);
        assert!(cfg.pipeline.synthesis_enabled);
        assert_eq!(cfg.pipeline.lock_policy, LockPolicy::Queue);
        let (name, provider) = cfg.active_provider();
        assert_eq!(name, "openai");
        assert_eq!(provider.api_base.as_deref(), Some("https://api.openai.com/v1"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.gateway.max_attempts = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.sandbox.max_operations = 42;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sandbox.max_operations, 42);
    }
}
