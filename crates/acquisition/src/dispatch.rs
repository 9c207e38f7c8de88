use omni_core::{Error, Module, Result};
use omni_storage::ModuleStore;
use serde_json::Value;
use tracing::info;

use crate::registry::{CommandRegistry, RegistryStatus};
use crate::sandbox::Sandbox;

/// CLI arguments arrive as strings; JSON literals are passed through typed.
pub fn parse_cli_args(args: &[String]) -> Vec<Value> {
    args.iter()
        .map(|a| serde_json::from_str::<Value>(a).unwrap_or_else(|_| Value::String(a.clone())))
        .collect()
}

/// Run `function` from `module` in a fresh sandbox engine.
pub fn invoke_module(sandbox: &Sandbox, module: &Module, function: &str, args: &[Value]) -> Result<Value> {
    let ast = sandbox.compile(&module.combined_source())?;
    sandbox.call(&ast, function, args)
}

/// Dispatch an acquired command by name through the registry.
pub fn run_capability(
    registry: &CommandRegistry,
    modules: &ModuleStore,
    sandbox: &Sandbox,
    name: &str,
    args: &[Value],
) -> Result<Value> {
    let entry = registry
        .get(name)
        .ok_or_else(|| Error::NotFound(format!("no acquired command '{}'", name)))?;
    if entry.status != RegistryStatus::Active {
        return Err(Error::Other(format!("command '{}' is {}", name, entry.status)));
    }

    let module = modules.load(name)?;
    info!(command = %name, function = %entry.dispatch_target.entry_function, "▶️ [dispatch] running");
    invoke_module(sandbox, &module, &entry.dispatch_target.entry_function, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_cli_args() {
        let args = vec!["Ann".to_string(), "42".to_string(), "[1,2]".to_string(), "\"q\"".to_string()];
        assert_eq!(parse_cli_args(&args), vec![json!("Ann"), json!(42), json!([1, 2]), json!("q")]);
    }

    #[test]
    fn test_invoke_module_uses_all_artifacts() {
        let mut module = Module::new("greet", "greet_user");
        module.set_artifact("greet_user", "fn greet_user(n) { decorate(n) }".to_string());
        module.set_artifact("decorate", "fn decorate(n) { `Hello, ${n}!` }".to_string());
        let out = invoke_module(&Sandbox::default(), &module, "greet_user", &[json!("Ann")]).unwrap();
        assert_eq!(out, json!("Hello, Ann!"));
    }

    #[test]
    fn test_unknown_command() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ModuleStore::new(omni_core::Paths::with_base(tmp.path().to_path_buf()));
        let err = run_capability(&CommandRegistry::new(), &store, &Sandbox::default(), "greet", &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
