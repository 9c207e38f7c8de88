use once_cell::sync::Lazy;
use omni_core::{CheckKind, Finding, Module, Plan, ValidationResult};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::sandbox::Sandbox;

static FORBIDDEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(import|eval)\b").expect("valid regex"));

fn finding(check: CheckKind, function: Option<&str>, message: impl Into<String>) -> Finding {
    Finding {
        check,
        function: function.map(|f| f.to_string()),
        message: message.into(),
    }
}

/// Lints and exercises a synthesized module in the sandbox. Never fails;
/// every problem is a finding.
#[derive(Debug, Clone, Default)]
pub struct ValidationRunner {
    sandbox: Sandbox,
}

impl ValidationRunner {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    pub fn validate(&self, module: &Module, plan: &Plan) -> ValidationResult {
        let mut findings = self.check_completeness(module, plan);
        if findings.is_empty() {
            findings.extend(self.check_static(module, plan));
            findings.extend(self.check_policy(module));
        }
        // 静态检查不过就不跑场景
        if findings.is_empty() {
            findings.extend(self.check_scenarios(module, plan));
        }

        let result = ValidationResult::from_findings(findings);
        if result.passed {
            info!(capability = %module.capability_name, "🧪 [validate] passed");
        } else {
            warn!(
                capability = %module.capability_name,
                findings = result.findings.len(),
                summary = %result.summary(),
                "🧪 [validate] failed"
            );
        }
        result
    }

    fn check_completeness(&self, module: &Module, plan: &Plan) -> Vec<Finding> {
        let mut findings = Vec::new();
        for f in &plan.proposed_functions {
            match module.artifact(&f.name) {
                Some(src) if !src.trim().is_empty() => {}
                Some(_) => findings.push(finding(CheckKind::Completeness, Some(&f.name), "artifact is empty")),
                None => findings.push(finding(CheckKind::Completeness, Some(&f.name), "artifact is missing")),
            }
        }
        if plan.function(&module.entry_point).is_none() {
            findings.push(finding(
                CheckKind::Completeness,
                Some(&module.entry_point),
                "entry point is not a planned function",
            ));
        }
        findings
    }

    fn check_static(&self, module: &Module, plan: &Plan) -> Vec<Finding> {
        let mut findings = Vec::new();
        for spec in &plan.proposed_functions {
            let Some(source) = module.artifact(&spec.name) else {
                continue;
            };
            let ast = match self.sandbox.compile(source) {
                Ok(ast) => ast,
                Err(e) => {
                    findings.push(finding(CheckKind::Static, Some(&spec.name), e.to_string()));
                    continue;
                }
            };
            let defined = Sandbox::functions(&ast);
            match defined.iter().find(|(name, _)| name == &spec.name) {
                None => findings.push(finding(
                    CheckKind::Static,
                    Some(&spec.name),
                    format!("artifact does not define fn {}", spec.name),
                )),
                Some((_, arity)) if *arity != spec.arity() => findings.push(finding(
                    CheckKind::Static,
                    Some(&spec.name),
                    format!("expected {} parameter(s), found {}", spec.arity(), arity),
                )),
                Some(_) => {}
            }
        }

        if findings.is_empty() {
            if let Err(e) = self.sandbox.compile(&module.combined_source()) {
                findings.push(finding(CheckKind::Static, None, format!("combined module: {}", e)));
            }
        }
        debug!(capability = %module.capability_name, findings = findings.len(), "🧪 [validate] static check");
        findings
    }

    fn check_policy(&self, module: &Module) -> Vec<Finding> {
        module
            .source_artifacts
            .iter()
            .filter_map(|a| {
                FORBIDDEN.captures(&a.source).map(|caps| {
                    finding(
                        CheckKind::Policy,
                        Some(&a.function),
                        format!("uses forbidden facility '{}'", &caps[1]),
                    )
                })
            })
            .collect()
    }

    fn check_scenarios(&self, module: &Module, plan: &Plan) -> Vec<Finding> {
        let mut scenarios: Vec<_> = module.scenarios.iter().collect();
        if let Some(smoke) = &module.smoke {
            if !module.scenarios.contains(smoke) {
                scenarios.push(smoke);
            }
        }
        if scenarios.is_empty() {
            return Vec::new();
        }

        let source = module.combined_source();
        let mut findings = Vec::new();
        for (i, scenario) in scenarios.into_iter().enumerate() {
            let label = format!("scenario #{}", i + 1);
            if plan.function(&scenario.function).is_none() {
                findings.push(finding(
                    CheckKind::Scenario,
                    Some(&scenario.function),
                    format!("{} targets an unplanned function", label),
                ));
                continue;
            }
            // 每个场景使用全新的编译结果和引擎
            let ast = match self.sandbox.compile(&source) {
                Ok(ast) => ast,
                Err(e) => {
                    findings.push(finding(CheckKind::Scenario, Some(&scenario.function), e.to_string()));
                    continue;
                }
            };
            match self.sandbox.call(&ast, &scenario.function, &scenario.args) {
                Ok(actual) => {
                    if let Some(expected) = &scenario.expected {
                        if &actual != expected {
                            findings.push(finding(
                                CheckKind::Scenario,
                                Some(&scenario.function),
                                format!("{}: expected {}, got {}", label, expected, actual),
                            ));
                        }
                    }
                }
                Err(e) => findings.push(finding(
                    CheckKind::Scenario,
                    Some(&scenario.function),
                    format!("{}: {}", label, e),
                )),
            }
        }
        findings
    }
}
