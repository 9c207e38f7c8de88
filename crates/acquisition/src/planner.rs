use chrono::Utc;
use omni_core::{
    validate_capability_name, CapabilityRequest, CliArgument, CliIntegration, Error, FunctionSpec,
    ParameterSpec, Plan, PlanKind, Result,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::{AttemptObserver, ExpectedShape, Gateway};

const KEY_PURPOSE: &str = "CapabilityPurpose";
const KEYS_FUNCTIONS: &[&str] = &["ProposedFunctions/Classes", "ProposedFunctions"];
const KEY_CLI: &str = "CLIIntegration";
const KEYS_DISPATCH: &[&str] = &["ModificationsToOmniPy", "DispatchModifications"];

/// Turns a capability request into a structured [`Plan`] through the gateway.
pub struct CapabilityPlanner {
    gateway: Arc<Gateway>,
}

impl CapabilityPlanner {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn expected_shape() -> ExpectedShape {
        ExpectedShape::json_object(&[&[KEY_PURPOSE], KEYS_FUNCTIONS, &[KEY_CLI]])
    }

    /// Exhausted gateway budgets become `PlanGeneration` (or `MalformedPlan`
    /// when the last response was unparsable); a response that parses as JSON
    /// but not as a plan is `MalformedPlan` and is not retried.
    pub async fn plan(
        &self,
        request: &CapabilityRequest,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let prompt = build_plan_prompt(request);
        let json = self
            .gateway
            .generate(&prompt, &Self::expected_shape(), observer, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled(m) => Error::Cancelled(m),
                Error::MalformedOutput(m) => Error::MalformedPlan(m),
                other => Error::PlanGeneration(other.to_string()),
            })?;

        let mut plan = parse_plan(&request.name, &json)?;
        if let Some(config) = &request.mcp_config {
            plan.kind = PlanKind::McpTool;
            plan.mcp_config = Some(config.clone());
        }
        info!(
            capability = %request.name,
            kind = %plan.kind,
            functions = plan.proposed_functions.len(),
            "🧭 [planner] plan parsed"
        );
        Ok(plan)
    }
}

pub fn build_plan_prompt(request: &CapabilityRequest) -> String {
    let mut prompt = String::new();
    match &request.mcp_config {
        Some(config) => {
            let config = serde_json::to_string_pretty(config).unwrap_or_else(|_| config.to_string());
            prompt.push_str("You are planning the integration of an external MCP (Multi-Agent Communication Protocol) tool for the 'omni' agent.\n");
            prompt.push_str(&format!(
                "The tool will be known locally as \"{}\" and is described as: \"{}\".\n",
                request.name, request.description
            ));
            prompt.push_str(&format!("Its MCP configuration is:\n{}\n\n", config));
            prompt.push_str("omni acts only as a client of this tool. The plan must cover: the connection strategy, ");
            prompt.push_str("how data is exchanged (request and response formats), the MCP errors to handle (connection, timeout, invalid response), ");
            prompt.push_str(&format!("and how users invoke the tool as `omni run {} <payload>`.\n", request.name));
            prompt.push_str(&format!(
                "The first proposed function must be `call_mcp_{}(payload)`, the entry point that wraps the interaction.\n\n",
                request.name
            ));
        }
        None => {
            prompt.push_str("You are planning a new capability for the 'omni' agent.\n");
            prompt.push_str(&format!(
                "The user wants to add a capability named \"{}\" with the following description: \"{}\".\n\n",
                request.name, request.description
            ));
        }
    }
    prompt.push_str("Capabilities are implemented as Rhai script functions that omni dispatches as CLI commands.\n");
    prompt.push_str("Produce a plan as a single JSON object with these keys:\n");
    prompt.push_str("1. CapabilityPurpose: string restating the purpose.\n");
    prompt.push_str("2. ProposedFunctions/Classes: non-empty array of {name, role, parameters: [{name, type}], returns: {type}}. The first function is the command entry point.\n");
    prompt.push_str("3. CLIIntegration: {command, arguments: [{name, description}]}.\n");
    prompt.push_str("4. ModificationsToOmniPy: array of strings describing dispatch changes.\n");
    prompt.push_str("5. RequiredLibraries, BasicErrorHandling, StorageConsiderations, SecurityConsiderations, TestingSuggestions: arrays of strings.\n\n");
    prompt.push_str("Function and parameter names must be identifiers (letters, digits, underscore).\n");
    prompt.push_str("Output only the JSON object.\n");
    prompt
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPlan(msg.into())
}

fn first_key<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn required_str(obj: &Map<String, Value>, key: &str, ctx: &str) -> Result<String> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(malformed(format!("{}.{} is empty", ctx, key))),
        Some(_) => Err(malformed(format!("{}.{} must be a string", ctx, key))),
        None => Err(malformed(format!("{} is missing '{}'", ctx, key))),
    }
}

/// 可选的文本段：字符串数组或单个字符串，null 视为空
fn text_list(obj: &Map<String, Value>, keys: &[&str]) -> Result<Vec<String>> {
    match first_key(obj, keys) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.trim().to_string()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(malformed(format!("{} must contain only strings", keys[0]))),
            })
            .collect(),
        Some(_) => Err(malformed(format!("{} must be a string or an array of strings", keys[0]))),
    }
}

fn parse_type(value: Option<&Value>, ctx: &str) -> Result<String> {
    match value {
        None | Some(Value::Null) => Ok("()".to_string()),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Object(o)) => match o.get("type") {
            Some(Value::String(s)) => Ok(s.trim().to_string()),
            _ => Err(malformed(format!("{}.returns.type must be a string", ctx))),
        },
        Some(_) => Err(malformed(format!("{}.returns must be a string or {{type}}", ctx))),
    }
}

fn parse_function(value: &Value, index: usize) -> Result<FunctionSpec> {
    let ctx = format!("ProposedFunctions[{}]", index);
    let obj = value
        .as_object()
        .ok_or_else(|| malformed(format!("{} must be an object", ctx)))?;

    let name = required_str(obj, "name", &ctx)?;
    validate_capability_name(&name)
        .map_err(|_| malformed(format!("{}.name '{}' is not an identifier", ctx, name)))?;

    let role = match obj.get("role") {
        Some(Value::String(s)) => s.trim().to_string(),
        None | Some(Value::Null) => String::new(),
        Some(_) => return Err(malformed(format!("{}.role must be a string", ctx))),
    };

    let parameters = match obj.get("parameters") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let pctx = format!("{}.parameters[{}]", ctx, i);
                let pobj = p
                    .as_object()
                    .ok_or_else(|| malformed(format!("{} must be an object", pctx)))?;
                let pname = required_str(pobj, "name", &pctx)?;
                validate_capability_name(&pname)
                    .map_err(|_| malformed(format!("{}.name '{}' is not an identifier", pctx, pname)))?;
                let ty = match pobj.get("type") {
                    Some(Value::String(s)) => s.trim().to_string(),
                    None | Some(Value::Null) => "any".to_string(),
                    Some(_) => return Err(malformed(format!("{}.type must be a string", pctx))),
                };
                Ok(ParameterSpec { name: pname, ty })
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(malformed(format!("{}.parameters must be an array", ctx))),
    };

    let returns = parse_type(obj.get("returns"), &ctx)?;
    Ok(FunctionSpec {
        name,
        role,
        parameters,
        returns,
    })
}

fn parse_cli(value: &Value) -> Result<CliIntegration> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("CLIIntegration must be an object"))?;
    let command_template = required_str(obj, "command", KEY_CLI)?;
    let arguments = match obj.get("arguments") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let actx = format!("CLIIntegration.arguments[{}]", i);
                let aobj = a
                    .as_object()
                    .ok_or_else(|| malformed(format!("{} must be an object", actx)))?;
                Ok(CliArgument {
                    name: required_str(aobj, "name", &actx)?,
                    description: aobj
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(malformed("CLIIntegration.arguments must be an array")),
    };
    Ok(CliIntegration {
        command_template,
        arguments,
    })
}

/// Parse gateway JSON into a [`Plan`] for `capability_name`.
pub fn parse_plan(capability_name: &str, json: &str) -> Result<Plan> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("plan must be a JSON object"))?;

    let purpose = required_str(obj, KEY_PURPOSE, "plan")?;

    let functions = match first_key(obj, KEYS_FUNCTIONS) {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .enumerate()
            .map(|(i, v)| parse_function(v, i))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Array(_)) => return Err(malformed("ProposedFunctions/Classes is empty")),
        Some(_) => return Err(malformed("ProposedFunctions/Classes must be an array")),
        None => return Err(malformed("plan is missing 'ProposedFunctions/Classes'")),
    };

    let mut seen = BTreeSet::new();
    for f in &functions {
        if !seen.insert(f.name.as_str()) {
            return Err(malformed(format!("function '{}' is proposed twice", f.name)));
        }
    }

    let cli = match obj.get(KEY_CLI) {
        Some(v) => parse_cli(v)?,
        None => return Err(malformed("plan is missing 'CLIIntegration'")),
    };

    Ok(Plan {
        capability_name: capability_name.to_string(),
        kind: PlanKind::GeneralCapability,
        mcp_config: None,
        purpose,
        proposed_functions: functions,
        cli_integration: cli,
        required_libraries: text_list(obj, &["RequiredLibraries"])?.into_iter().collect(),
        dispatch_modifications: text_list(obj, KEYS_DISPATCH)?,
        error_handling_notes: text_list(obj, &["BasicErrorHandling"])?,
        storage_notes: text_list(obj, &["StorageConsiderations"])?,
        security_notes: text_list(obj, &["SecurityConsiderations"])?,
        testing_notes: text_list(obj, &["TestingSuggestions"])?,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingObserver, ScriptedGenerator, GREET_PLAN_JSON};
    use omni_core::config::GatewayConfig;

    fn gateway(responses: Vec<String>) -> Arc<Gateway> {
        Arc::new(Gateway::new(
            Arc::new(ScriptedGenerator::new(responses)),
            GatewayConfig {
                max_attempts: 2,
                retry_delay_ms: 1,
                max_retry_delay_ms: 2,
                timeout_secs: 5,
                retry_malformed: true,
            },
        ))
    }

    #[test]
    fn test_parse_example_plan() {
        let plan = parse_plan("greet", GREET_PLAN_JSON).unwrap();
        assert_eq!(plan.capability_name, "greet");
        assert_eq!(plan.proposed_functions[0].name, "greet_user");
        assert_eq!(plan.proposed_functions[0].parameters[0].ty, "str");
        assert_eq!(plan.proposed_functions[0].returns, "str");
        assert_eq!(plan.cli_integration.command_template, "omni greet <name>");
        assert_eq!(plan.dispatch_modifications.len(), 2);
        assert_eq!(plan.testing_notes, vec!["Test with name, without name."]);
        assert!(plan.required_libraries.is_empty());
    }

    #[test]
    fn test_parse_aliases_and_single_strings() {
        let json = r#"{
            "CapabilityPurpose": "Browse buckets",
            "ProposedFunctions": [{"name": "list_buckets", "role": "lists", "returns": "array"}],
            "CLIIntegration": {"command": "omni minio_browser list"},
            "DispatchModifications": "Route minio_browser",
            "RequiredLibraries": ["minio", "minio"],
            "SecurityConsiderations": "Keep keys out of logs"
        }"#;
        let plan = parse_plan("minio_browser", json).unwrap();
        assert_eq!(plan.proposed_functions[0].returns, "array");
        assert_eq!(plan.dispatch_modifications, vec!["Route minio_browser"]);
        assert_eq!(plan.required_libraries.len(), 1);
        assert_eq!(plan.security_notes, vec!["Keep keys out of logs"]);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let cases = [
            r#"{"ProposedFunctions/Classes": [], "CLIIntegration": {"command": "x"}, "CapabilityPurpose": "p"}"#,
            r#"{"ProposedFunctions/Classes": [{"name": "a b", "returns": "str"}], "CLIIntegration": {"command": "x"}, "CapabilityPurpose": "p"}"#,
            r#"{"ProposedFunctions/Classes": [{"name": "a"}], "CLIIntegration": "x", "CapabilityPurpose": "p"}"#,
            r#"{"ProposedFunctions/Classes": [{"name": "a"}], "CLIIntegration": {"command": "x"}, "CapabilityPurpose": 3}"#,
            r#"{"ProposedFunctions/Classes": [{"name": "a"}, {"name": "a"}], "CLIIntegration": {"command": "x"}, "CapabilityPurpose": "p"}"#,
            r#"{"ProposedFunctions/Classes": [{"name": "a"}], "CLIIntegration": {"command": "x"}, "CapabilityPurpose": "p", "TestingSuggestions": 5}"#,
        ];
        for case in cases {
            assert!(
                matches!(parse_plan("x", case), Err(Error::MalformedPlan(_))),
                "expected MalformedPlan for {}",
                case
            );
        }
    }

    #[test]
    fn test_prompt_embeds_request() {
        let req = CapabilityRequest::new("greet", "say hello");
        let prompt = build_plan_prompt(&req);
        assert!(prompt.contains("\"greet\""));
        assert!(prompt.contains("say hello"));
    }

    #[test]
    fn test_mcp_prompt_covers_client_integration() {
        let config = serde_json::json!({"url": "http://mcp.example.com/query", "protocol_version": "1.1"});
        let req = CapabilityRequest::mcp_tool("kb", config, "query the knowledge base");
        let prompt = build_plan_prompt(&req);
        assert!(prompt.contains("MCP"));
        assert!(prompt.contains("http://mcp.example.com/query"));
        assert!(prompt.contains("call_mcp_kb(payload)"));
        assert!(prompt.contains("omni run kb"));
        assert!(prompt.contains("connection strategy"));
        assert!(!prompt.contains("Rhai function"));
    }

    #[tokio::test]
    async fn test_mcp_plan_carries_kind_and_config() {
        let planner = CapabilityPlanner::new(gateway(vec![GREET_PLAN_JSON.to_string()]));
        let config = serde_json::json!({"url": "http://kb.local"});
        let req = CapabilityRequest::mcp_tool("kb", config.clone(), "query the knowledge base");
        let plan = planner
            .plan(&req, &RecordingObserver::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.kind, PlanKind::McpTool);
        assert_eq!(plan.mcp_config, Some(config));

        let general = parse_plan("greet", GREET_PLAN_JSON).unwrap();
        assert_eq!(general.kind, PlanKind::GeneralCapability);
        let stored = serde_json::to_value(&general).unwrap();
        assert_eq!(stored["type"], "general_capability");
        assert!(stored.get("mcp_config").is_none());
    }

    #[tokio::test]
    async fn test_plan_via_gateway() {
        let planner = CapabilityPlanner::new(gateway(vec![format!(
            "<think>ok</think>```json\n{}\n```",
            GREET_PLAN_JSON
        )]));
        let req = CapabilityRequest::new("greet", "say hello");
        let plan = planner
            .plan(&req, &RecordingObserver::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.proposed_functions[0].name, "greet_user");
    }

    #[tokio::test]
    async fn test_plan_error_mapping() {
        let req = CapabilityRequest::new("greet", "say hello");

        let planner = CapabilityPlanner::new(gateway(vec!["garbage".into(), "more garbage".into()]));
        let err = planner
            .plan(&req, &RecordingObserver::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedPlan(_)));

        let planner = CapabilityPlanner::new(gateway(vec![]));
        let err = planner
            .plan(&req, &RecordingObserver::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlanGeneration(_)));
    }
}
