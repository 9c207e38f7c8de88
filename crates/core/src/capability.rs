use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

pub const MAX_NAME_LEN: usize = 64;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

// (?s)：描述可以跨行
static RAW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)^add\s+(\S+)\s+"(.*)"$"#).expect("valid regex"));

static MCP_RAW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)^add_mcp_tool\s+(\S+)\s+(.*)$"#).expect("valid regex"));

/// 能力名称校验：ASCII 字母数字 + 下划线
pub fn validate_capability_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::RequestValidation("capability name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::RequestValidation(format!(
            "capability name '{}' exceeds {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if !NAME_RE.is_match(name) {
        return Err(Error::RequestValidation(format!(
            "capability name '{}' must contain only ASCII letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

/// Parse the `<mcp_config_json>` argument of `add_mcp_tool`; it must be a JSON object.
pub fn parse_mcp_config(raw: &str) -> Result<serde_json::Value> {
    let config: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| Error::RequestValidation(format!("invalid JSON in MCP configuration: {}", e)))?;
    if !config.is_object() {
        return Err(Error::RequestValidation(
            "MCP configuration must be a JSON object".to_string(),
        ));
    }
    Ok(config)
}

/// One `add <name> "<description>"` or
/// `add_mcp_tool <name> <mcp_config_json> "<description>"` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub request_id: String,
    pub name: String,
    pub description: String,
    /// Connection details of an external MCP tool; `None` for a general capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<serde_json::Value>,
}

impl CapabilityRequest {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            mcp_config: None,
        }
    }

    pub fn mcp_tool(name: &str, config: serde_json::Value, description: &str) -> Self {
        Self {
            mcp_config: Some(config),
            ..Self::new(name, description)
        }
    }

    pub fn is_mcp_tool(&self) -> bool {
        self.mcp_config.is_some()
    }

    /// The verbatim command line, logged as the request entry.
    pub fn raw(&self) -> String {
        match &self.mcp_config {
            Some(config) => format!(
                "add_mcp_tool {} {} \"{}\"",
                self.name, config, self.description
            ),
            None => format!("add {} \"{}\"", self.name, self.description),
        }
    }

    /// Rebuild a request from a logged `raw()` line, keeping the original request id.
    pub fn from_raw(request_id: &str, raw: &str) -> Option<Self> {
        let raw = raw.trim();

        if let Some(caps) = MCP_RAW_RE.captures(raw) {
            let rest = caps.get(2)?.as_str();
            // 配置是紧凑 JSON，后面跟带引号的描述
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<serde_json::Value>();
            let config = stream.next()?.ok()?;
            let description = rest[stream.byte_offset()..]
                .trim()
                .strip_prefix('"')?
                .strip_suffix('"')?;
            return Some(Self {
                request_id: request_id.to_string(),
                name: caps.get(1)?.as_str().to_string(),
                description: description.to_string(),
                mcp_config: Some(config),
            });
        }

        let caps = RAW_RE.captures(raw)?;
        Some(Self {
            request_id: request_id.to_string(),
            name: caps.get(1)?.as_str().to_string(),
            description: caps.get(2)?.as_str().to_string(),
            mcp_config: None,
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_capability_name(&self.name)?;
        if self.description.trim().is_empty() {
            return Err(Error::RequestValidation("description is empty".to_string()));
        }
        if let Some(config) = &self.mcp_config {
            if !config.is_object() {
                return Err(Error::RequestValidation(
                    "MCP configuration must be a JSON object".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub returns: String,
}

impl FunctionSpec {
    pub fn arity(&self) -> usize {
        self.parameters.len()
    }

    /// `name(a: string, b: int) -> string`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty))
            .collect();
        format!("{}({}) -> {}", self.name, params.join(", "), self.returns)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliArgument {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliIntegration {
    pub command_template: String,
    #[serde(default)]
    pub arguments: Vec<CliArgument>,
}

/// What a plan integrates: a self-contained command or a client for an external MCP tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    #[default]
    GeneralCapability,
    McpTool,
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanKind::GeneralCapability => write!(f, "general_capability"),
            PlanKind::McpTool => write!(f, "mcp_tool"),
        }
    }
}

/// Structured plan for one capability. One current plan per name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub capability_name: String,
    #[serde(default, rename = "type")]
    pub kind: PlanKind,
    /// Copied from the request for MCP tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<serde_json::Value>,
    pub purpose: String,
    pub proposed_functions: Vec<FunctionSpec>,
    pub cli_integration: CliIntegration,
    #[serde(default)]
    pub required_libraries: BTreeSet<String>,
    #[serde(default)]
    pub dispatch_modifications: Vec<String>,
    #[serde(default)]
    pub error_handling_notes: Vec<String>,
    #[serde(default)]
    pub storage_notes: Vec<String>,
    #[serde(default)]
    pub security_notes: Vec<String>,
    #[serde(default)]
    pub testing_notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// The function dispatched by the capability's command.
    pub fn entry_function(&self) -> Option<&FunctionSpec> {
        self.proposed_functions.first()
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.proposed_functions.iter().find(|f| f.name == name)
    }
}

/// A test scenario: call `function` with `args`, optionally compare the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub function: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceArtifact {
    pub function: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Completeness,
    Static,
    Policy,
    Scenario,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckKind::Completeness => "completeness",
            CheckKind::Static => "static",
            CheckKind::Policy => "policy",
            CheckKind::Scenario => "scenario",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub check: CheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub message: String,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(func) => write!(f, "[{}] {}: {}", self.check, func, self.message),
            None => write!(f, "[{}] {}", self.check, self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ValidationResult {
    pub passed: bool,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ValidationResult {
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        Self {
            passed: findings.is_empty(),
            findings,
        }
    }

    pub fn summary(&self) -> String {
        if self.passed {
            return "all checks passed".to_string();
        }
        self.findings
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Synthesized source artifacts for a plan, in plan order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Module {
    pub capability_name: String,
    pub entry_point: String,
    pub source_artifacts: Vec<SourceArtifact>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke: Option<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
}

impl Module {
    pub fn new(capability_name: &str, entry_point: &str) -> Self {
        Self {
            capability_name: capability_name.to_string(),
            entry_point: entry_point.to_string(),
            source_artifacts: Vec::new(),
            scenarios: Vec::new(),
            smoke: None,
            validation_result: None,
        }
    }

    pub fn artifact(&self, function: &str) -> Option<&str> {
        self.source_artifacts
            .iter()
            .find(|a| a.function == function)
            .map(|a| a.source.as_str())
    }

    /// Insert or replace the artifact for `function`, keeping first-insertion order.
    pub fn set_artifact(&mut self, function: &str, source: String) {
        if let Some(existing) = self.source_artifacts.iter_mut().find(|a| a.function == function) {
            existing.source = source;
        } else {
            self.source_artifacts.push(SourceArtifact {
                function: function.to_string(),
                source,
            });
        }
    }

    pub fn is_validated(&self) -> bool {
        self.validation_result.as_ref().map(|v| v.passed).unwrap_or(false)
    }

    /// All artifacts concatenated into one script, in plan order.
    pub fn combined_source(&self) -> String {
        self.source_artifacts
            .iter()
            .map(|a| a.source.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_capability_name("greet").is_ok());
        assert!(validate_capability_name("minio_browser_2").is_ok());
        assert!(validate_capability_name("x y").is_err());
        assert!(validate_capability_name("").is_err());
        assert!(validate_capability_name("naïve").is_err());
        assert!(validate_capability_name(&"a".repeat(65)).is_err());
        assert!(validate_capability_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_request_validate_and_raw() {
        let req = CapabilityRequest::new("greet", "say hello");
        assert!(req.validate().is_ok());
        assert_eq!(req.raw(), "add greet \"say hello\"");

        let parsed = CapabilityRequest::from_raw(&req.request_id, &req.raw()).unwrap();
        assert_eq!(parsed, req);

        let empty = CapabilityRequest::new("greet", "   ");
        assert!(matches!(empty.validate(), Err(Error::RequestValidation(_))));
    }

    #[test]
    fn test_multiline_description_survives_raw() {
        let req = CapabilityRequest::new("greet", "say hello\nto the user");
        let parsed = CapabilityRequest::from_raw(&req.request_id, &req.raw()).unwrap();
        assert_eq!(parsed.description, "say hello\nto the user");
        assert_eq!(parsed, req);

        assert!(CapabilityRequest::from_raw("r", "remove greet").is_none());
    }

    #[test]
    fn test_mcp_config_parsing() {
        let config = parse_mcp_config(r#"{"url": "http://mcp.example.com/query", "protocol_version": "1.1"}"#)
            .unwrap();
        assert_eq!(config["protocol_version"], "1.1");

        match parse_mcp_config("{not json") {
            Err(Error::RequestValidation(msg)) => assert!(msg.contains("invalid JSON")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse_mcp_config("[1, 2]"),
            Err(Error::RequestValidation(_))
        ));
    }

    #[test]
    fn test_mcp_request_raw_keeps_config() {
        let config = serde_json::json!({"url": "http://kb.local/q", "note": "a \"quoted\" word"});
        let req = CapabilityRequest::mcp_tool("kb", config.clone(), "query the\nknowledge base");
        assert!(req.is_mcp_tool());
        assert!(req.validate().is_ok());
        assert!(req.raw().starts_with("add_mcp_tool kb {"));

        let parsed = CapabilityRequest::from_raw(&req.request_id, &req.raw()).unwrap();
        assert_eq!(parsed.mcp_config, Some(config));
        assert_eq!(parsed, req);

        let bad = CapabilityRequest::mcp_tool("kb", serde_json::json!("url"), "query");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_module_artifacts_keep_order() {
        let mut module = Module::new("greet", "greet_user");
        module.set_artifact("greet_user", "fn greet_user(n) { n }".to_string());
        module.set_artifact("helper", "fn helper() { 1 }".to_string());
        module.set_artifact("greet_user", "fn greet_user(n) { `hi ${n}` }".to_string());

        let names: Vec<&str> = module.source_artifacts.iter().map(|a| a.function.as_str()).collect();
        assert_eq!(names, vec!["greet_user", "helper"]);
        assert!(module.artifact("greet_user").unwrap().contains("hi"));
        assert!(!module.is_validated());
    }

    #[test]
    fn test_validation_summary() {
        let ok = ValidationResult::from_findings(vec![]);
        assert!(ok.passed);
        let bad = ValidationResult::from_findings(vec![Finding {
            check: CheckKind::Static,
            function: Some("greet_user".to_string()),
            message: "syntax error".to_string(),
        }]);
        assert!(!bad.passed);
        assert_eq!(bad.summary(), "[static] greet_user: syntax error");
    }
}
