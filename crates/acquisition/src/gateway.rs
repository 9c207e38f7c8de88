use async_trait::async_trait;
use omni_core::config::GatewayConfig;
use omni_core::{ChatMessage, Error, Result};
use omni_providers::Provider;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// "send prompt, get text back". May fail, hang or return garbage.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Adapts a chat [`Provider`] to a single-prompt [`TextGenerator`].
pub struct ProviderGenerator {
    provider: Arc<dyn Provider>,
    system_prompt: String,
}

impl ProviderGenerator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            system_prompt: "You are a precise software architect. Follow the requested output format exactly."
                .to_string(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &str) -> Self {
        self.system_prompt = system_prompt.to_string();
        self
    }
}

#[async_trait]
impl TextGenerator for ProviderGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(prompt),
        ];
        let response = self.provider.chat(&messages).await?;
        Ok(response.text().to_string())
    }
}

/// What a response must look like before anyone trusts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedShape {
    /// A JSON object; each group lists acceptable spellings of one required key.
    JsonObject { required: Vec<Vec<String>> },
    /// A fenced (or bare) source block in `language`.
    Code { language: String },
}

impl ExpectedShape {
    pub fn json_object(required: &[&[&str]]) -> Self {
        ExpectedShape::JsonObject {
            required: required
                .iter()
                .map(|group| group.iter().map(|k| k.to_string()).collect())
                .collect(),
        }
    }

    pub fn code(language: &str) -> Self {
        ExpectedShape::Code {
            language: language.to_string(),
        }
    }

    /// Extract the trusted payload from raw model text, or explain why it is malformed.
    pub fn check(&self, raw: &str) -> std::result::Result<String, String> {
        let text = strip_think_blocks(raw);
        match self {
            ExpectedShape::JsonObject { required } => {
                let json = extract_json_object(&text)
                    .ok_or_else(|| "response contains no JSON object".to_string())?;
                let value: serde_json::Value =
                    serde_json::from_str(&json).map_err(|e| format!("invalid JSON: {}", e))?;
                let obj = value
                    .as_object()
                    .ok_or_else(|| "top-level JSON value is not an object".to_string())?;
                for group in required {
                    if !group.iter().any(|k| obj.contains_key(k)) {
                        return Err(format!("missing required key '{}'", group.join("' | '")));
                    }
                }
                Ok(json)
            }
            ExpectedShape::Code { language } => {
                let code = extract_code_block(&text, language)
                    .ok_or_else(|| format!("response contains no {} code", language))?;
                if code.trim().is_empty() {
                    return Err(format!("empty {} code block", language));
                }
                Ok(code)
            }
        }
    }
}

/// One failed attempt inside the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub max_attempts: u32,
    /// `GatewayError` or `MalformedOutputError`.
    pub kind: &'static str,
    pub message: String,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempt {}/{} failed: {}: {}",
            self.attempt, self.max_attempts, self.kind, self.message
        )
    }
}

/// Receives every failed attempt as it happens (the orchestrator writes them to the TMS).
pub trait AttemptObserver: Send + Sync {
    fn attempt_failed(&self, failure: &AttemptFailure) -> Result<()>;
}

pub struct NoopObserver;

impl AttemptObserver for NoopObserver {
    fn attempt_failed(&self, _failure: &AttemptFailure) -> Result<()> {
        Ok(())
    }
}

/// Retry, backoff, timeout and shape validation around a [`TextGenerator`].
pub struct Gateway {
    generator: Arc<dyn TextGenerator>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(generator: Arc<dyn TextGenerator>, config: GatewayConfig) -> Self {
        Self { generator, config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// 指数退避：base * 2^(attempt-1)，封顶 max_retry_delay_ms
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .config
            .retry_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.max_retry_delay_ms);
        Duration::from_millis(ms)
    }

    /// Generate text matching `shape`, returning the extracted payload.
    ///
    /// Timeouts and generator errors are `GatewayError` attempts; shape
    /// violations are `MalformedOutputError` attempts. When the budget is spent
    /// the error reflects the last attempt.
    pub async fn generate(
        &self,
        prompt: &str,
        shape: &ExpectedShape,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        debug!(prompt_len = prompt.len(), prompt = %prompt, "🛰️ [gateway] prompt");

        let mut last: Option<AttemptFailure> = None;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled("cancelled before gateway call".to_string()));
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("cancelled during gateway call".to_string()));
                }
                r = tokio::time::timeout(timeout, self.generator.generate(prompt)) => r,
            };

            let failure = match outcome {
                Err(_) => AttemptFailure {
                    attempt,
                    max_attempts,
                    kind: "GatewayError",
                    message: format!("timed out after {}s", timeout.as_secs()),
                },
                Ok(Err(Error::Cancelled(msg))) => return Err(Error::Cancelled(msg)),
                Ok(Err(e)) => AttemptFailure {
                    attempt,
                    max_attempts,
                    kind: "GatewayError",
                    message: e.to_string(),
                },
                Ok(Ok(raw)) => {
                    debug!(response_len = raw.len(), response = %raw, "🛰️ [gateway] response");
                    match shape.check(&raw) {
                        Ok(payload) => {
                            info!(attempt, "🛰️ [gateway] response accepted");
                            return Ok(payload);
                        }
                        Err(reason) => AttemptFailure {
                            attempt,
                            max_attempts,
                            kind: "MalformedOutputError",
                            message: reason,
                        },
                    }
                }
            };

            warn!(attempt, max_attempts, kind = failure.kind, error = %failure.message, "🛰️ [gateway] attempt failed");
            observer.attempt_failed(&failure)?;

            let malformed = failure.kind == "MalformedOutputError";
            last = Some(failure);
            if malformed && !self.config.retry_malformed {
                break;
            }

            if attempt < max_attempts {
                let delay = self.backoff_delay(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled("cancelled during backoff".to_string()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        match last {
            Some(f) if f.kind == "MalformedOutputError" => Err(Error::MalformedOutput(f.message)),
            Some(f) => Err(Error::Gateway(format!(
                "{} (after {} attempts)",
                f.message, f.attempt
            ))),
            None => Err(Error::Gateway("no attempt was made".to_string())),
        }
    }
}

/// 去掉推理模型的 <think>…</think> 前言
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The body of the first ```<language> fence, then any fence, then the bare text.
pub fn extract_code_block(text: &str, language: &str) -> Option<String> {
    let tagged = format!("```{}", language);
    if let Some(start) = text.find(&tagged) {
        let after = start + tagged.len();
        if let Some(end) = text[after..].find("```") {
            return Some(text[after..after + end].trim().to_string());
        }
    }

    if let Some(start) = text.find("```") {
        let after = start + 3;
        let body_start = text[after..]
            .find('\n')
            .map(|i| after + i + 1)
            .unwrap_or(after);
        if let Some(end) = text[body_start..].find("```") {
            return Some(text[body_start..body_start + end].trim().to_string());
        }
    }

    let bare = text.trim();
    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

/// The first complete, brace-balanced JSON object in `text` (string-literal aware).
pub fn extract_json_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..=i];
                        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                            return Some(candidate.to_string());
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingGenerator, RecordingObserver, ScriptedGenerator, SlowGenerator};

    fn config(max_attempts: u32) -> GatewayConfig {
        GatewayConfig {
            max_attempts,
            retry_delay_ms: 1,
            max_retry_delay_ms: 4,
            timeout_secs: 1,
            retry_malformed: true,
        }
    }

    fn plan_shape() -> ExpectedShape {
        ExpectedShape::json_object(&[&["CapabilityPurpose"]])
    }

    #[test]
    fn test_extract_json_object_variants() {
        let fenced = "Here you go:\n```json\n{\"a\": {\"b\": \"}\"}}\n```";
        assert_eq!(extract_json_object(fenced).unwrap(), "{\"a\": {\"b\": \"}\"}}");
        let prose = "I think {not json} then {\"ok\": true} trailing";
        assert_eq!(extract_json_object(prose).unwrap(), "{\"ok\": true}");
        assert!(extract_json_object("no braces here").is_none());
    }

    #[test]
    fn test_strip_think_blocks() {
        let raw = "<think>reasoning {\"x\":1}</think>{\"CapabilityPurpose\":\"p\"}";
        let stripped = strip_think_blocks(raw);
        assert_eq!(stripped, "{\"CapabilityPurpose\":\"p\"}");
        assert_eq!(plan_shape().check(raw).unwrap(), "{\"CapabilityPurpose\":\"p\"}");
    }

    #[test]
    fn test_code_shape() {
        let shape = ExpectedShape::code("rhai");
        let raw = "Sure:\n```rhai\nfn greet_user(n) { n }\n```\n";
        assert_eq!(shape.check(raw).unwrap(), "fn greet_user(n) { n }");
        assert!(shape.check("```rhai\n\n```").is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let gw = Gateway::new(
            Arc::new(ScriptedGenerator::new(vec![])),
            GatewayConfig {
                retry_delay_ms: 500,
                max_retry_delay_ms: 3000,
                ..GatewayConfig::default()
            },
        );
        assert_eq!(gw.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(gw.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(gw.backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(gw.backoff_delay(4), Duration::from_millis(3000));
        assert_eq!(gw.backoff_delay(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_malformed_then_valid() {
        let gen = Arc::new(ScriptedGenerator::new(vec![
            "not json at all".to_string(),
            "{\"CapabilityPurpose\": \"greet\"}".to_string(),
        ]));
        let gw = Gateway::new(gen.clone(), config(2));
        let observer = RecordingObserver::default();
        let out = gw
            .generate("p", &plan_shape(), &observer, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.contains("greet"));
        let failures = observer.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "MalformedOutputError");
        assert_eq!(gen.calls(), 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted_reports_last_kind() {
        let gw = Gateway::new(
            Arc::new(ScriptedGenerator::new(vec!["nope".into(), "still nope".into()])),
            config(2),
        );
        let observer = RecordingObserver::default();
        let err = gw
            .generate("p", &plan_shape(), &observer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOutput(_)));
        assert_eq!(observer.failures().len(), 2);

        let gw = Gateway::new(Arc::new(FailingGenerator), config(3));
        let observer = RecordingObserver::default();
        let err = gw
            .generate("p", &plan_shape(), &observer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
        assert!(observer.failures().iter().all(|f| f.kind == "GatewayError"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_gateway_failure() {
        let gw = Gateway::new(
            Arc::new(SlowGenerator::new(Duration::from_secs(5), "{}")),
            config(1),
        );
        let observer = RecordingObserver::default();
        let err = gw
            .generate("p", &plan_shape(), &observer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
        assert!(observer.failures()[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_call() {
        let gw = Gateway::new(
            Arc::new(SlowGenerator::new(Duration::from_secs(5), "{}")),
            GatewayConfig {
                timeout_secs: 30,
                ..config(1)
            },
        );
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let err = gw
            .generate("p", &plan_shape(), &NoopObserver, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_no_retry_when_malformed_retry_disabled() {
        let gen = Arc::new(ScriptedGenerator::new(vec!["bad".into(), "{\"CapabilityPurpose\":1}".into()]));
        let gw = Gateway::new(
            gen.clone(),
            GatewayConfig {
                retry_malformed: false,
                ..config(2)
            },
        );
        let err = gw
            .generate("p", &plan_shape(), &NoopObserver, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOutput(_)));
        assert_eq!(gen.calls(), 1);
    }
}
