use async_trait::async_trait;
use omni_core::{Error, FunctionSpec, Plan, Result, Scenario};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::{extract_json_object, strip_think_blocks, AttemptObserver, ExpectedShape, Gateway};

/// Produces one source artifact per planned function, plus test scenarios.
#[async_trait]
pub trait CodeSynthesizer: Send + Sync {
    /// A deferred synthesizer never writes code; workflows stop at PLANNED.
    fn is_deferred(&self) -> bool {
        false
    }

    /// `feedback` carries validation findings from a previous round.
    async fn synthesize_function(
        &self,
        plan: &Plan,
        function: &FunctionSpec,
        feedback: Option<&str>,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn synthesize_scenarios(
        &self,
        plan: &Plan,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<Vec<Scenario>>;
}

/// Placeholder used while code generation is switched off.
pub struct DeferredSynthesizer;

#[async_trait]
impl CodeSynthesizer for DeferredSynthesizer {
    fn is_deferred(&self) -> bool {
        true
    }

    async fn synthesize_function(
        &self,
        _plan: &Plan,
        function: &FunctionSpec,
        _feedback: Option<&str>,
        _observer: &dyn AttemptObserver,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        Err(Error::Synthesis(format!(
            "code synthesis is disabled (requested fn {})",
            function.name
        )))
    }

    async fn synthesize_scenarios(
        &self,
        _plan: &Plan,
        _observer: &dyn AttemptObserver,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Scenario>> {
        Ok(Vec::new())
    }
}

/// Asks the language model for Rhai code, one function at a time.
pub struct GatewaySynthesizer {
    gateway: Arc<Gateway>,
}

impl GatewaySynthesizer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl CodeSynthesizer for GatewaySynthesizer {
    async fn synthesize_function(
        &self,
        plan: &Plan,
        function: &FunctionSpec,
        feedback: Option<&str>,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let prompt = build_function_prompt(plan, function, feedback);
        let code = self
            .gateway
            .generate(&prompt, &ExpectedShape::code("rhai"), observer, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled(m) => Error::Cancelled(m),
                other => Error::Synthesis(format!("fn {}: {}", function.name, other)),
            })?;

        if !code.contains(&format!("fn {}", function.name)) {
            return Err(Error::Synthesis(format!(
                "response does not define fn {}",
                function.name
            )));
        }
        info!(
            capability = %plan.capability_name,
            function = %function.name,
            bytes = code.len(),
            "🛠️ [synth] function generated"
        );
        Ok(code)
    }

    async fn synthesize_scenarios(
        &self,
        plan: &Plan,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<Vec<Scenario>> {
        let prompt = build_scenarios_prompt(plan);
        // 场景是 JSON 数组，不是对象，按代码块提取
        let raw = self
            .gateway
            .generate(&prompt, &ExpectedShape::code("json"), observer, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled(m) => Error::Cancelled(m),
                other => Error::Synthesis(other.to_string()),
            })?;
        let scenarios = parse_scenarios(plan, &raw)?;
        debug!(capability = %plan.capability_name, count = scenarios.len(), "🛠️ [synth] scenarios generated");
        Ok(scenarios)
    }
}

pub fn build_function_prompt(plan: &Plan, function: &FunctionSpec, feedback: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Write one Rhai function for the '{}' capability of the omni agent.\n",
        plan.capability_name
    ));
    prompt.push_str(&format!("Capability purpose: {}\n\n", plan.purpose));
    prompt.push_str("Functions in this capability:\n");
    for f in &plan.proposed_functions {
        prompt.push_str(&format!("- {}: {}\n", f.signature(), f.role));
    }
    prompt.push_str(&format!(
        "\nImplement exactly this Rhai function: {}\nRole: {}\n",
        function.signature(),
        function.role
    ));
    if !plan.error_handling_notes.is_empty() {
        prompt.push_str("Error handling:\n");
        for note in &plan.error_handling_notes {
            prompt.push_str(&format!("- {}\n", note));
        }
    }
    prompt.push_str("\nRules:\n");
    prompt.push_str(&format!(
        "- Define `fn {}` with {} parameter(s); parameter types are advisory.\n",
        function.name,
        function.arity()
    ));
    prompt.push_str("- Other functions of this capability may be called by name.\n");
    prompt.push_str("- Do not use `import` or `eval`.\n");
    prompt.push_str("- Use `throw` for errors.\n");
    if let Some(config) = &plan.mcp_config {
        // 沙箱没有网络：MCP 函数只做占位，返回将要发送的请求
        prompt.push_str(&format!("- This function fronts the external MCP tool configured as {}.\n", config));
        prompt.push_str("- The sandbox has no network access: build the MCP request from the payload and return it as a map with `endpoint` and `payload` keys instead of sending it.\n");
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\nThe previous version failed validation:\n{}\nFix these problems.\n",
            feedback
        ));
    }
    prompt.push_str("\nReply with a single ```rhai code block.\n");
    prompt
}

pub fn build_scenarios_prompt(plan: &Plan) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Write test scenarios for the '{}' capability of the omni agent.\n",
        plan.capability_name
    ));
    prompt.push_str(&format!("Capability purpose: {}\n\nFunctions:\n", plan.purpose));
    for f in &plan.proposed_functions {
        prompt.push_str(&format!("- {}: {}\n", f.signature(), f.role));
    }
    if !plan.testing_notes.is_empty() {
        prompt.push_str("\nSuggestions:\n");
        for note in &plan.testing_notes {
            prompt.push_str(&format!("- {}\n", note));
        }
    }
    prompt.push_str("\nReply with a ```json code block holding an array of objects ");
    prompt.push_str("{\"function\": name, \"args\": [..], \"expected\": value}. ");
    prompt.push_str("Omit \"expected\" when the result cannot be predicted exactly.\n");
    prompt
}

/// Parse a scenario array, dropping entries that target unplanned functions
/// or carry the wrong number of arguments.
pub fn parse_scenarios(plan: &Plan, raw: &str) -> Result<Vec<Scenario>> {
    let text = strip_think_blocks(raw);
    let trimmed = text.trim();
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        // 兼容模型把数组包在对象里 {"scenarios": [...]}
        Err(_) => {
            let obj = extract_json_object(trimmed)
                .ok_or_else(|| Error::Synthesis("scenarios are not valid JSON".to_string()))?;
            serde_json::from_str(&obj)?
        }
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("scenarios") {
            Some(Value::Array(items)) => items,
            _ => return Err(Error::Synthesis("expected an array of scenarios".to_string())),
        },
        _ => return Err(Error::Synthesis("expected an array of scenarios".to_string())),
    };

    let mut scenarios = Vec::new();
    for item in items {
        let scenario: Scenario = match serde_json::from_value(item) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "🛠️ [synth] skipping unreadable scenario");
                continue;
            }
        };
        match plan.function(&scenario.function) {
            Some(f) if f.arity() == scenario.args.len() => scenarios.push(scenario),
            _ => warn!(function = %scenario.function, "🛠️ [synth] skipping scenario for unknown signature"),
        }
    }
    Ok(scenarios)
}
