use omni_core::config::SandboxConfig;
use omni_core::{Error, Result};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Embedded Rhai engine with no module resolution, no `eval`, and bounded
/// operations, call depth, collection sizes and wall-clock time.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn create_engine(&self) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_string_size(self.config.max_string_size);
        engine.set_max_array_size(self.config.max_array_size);
        engine.set_max_map_size(self.config.max_map_size);
        engine.set_max_call_levels(self.config.max_call_depth);
        engine.set_max_expr_depths(64, 64);

        // 隔离：不解析任何外部模块，禁用 eval
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.on_print(|text| debug!(output = %text, "🧪 [sandbox] print"));
        engine.on_debug(|text, _source, pos| debug!(output = %text, position = %pos, "🧪 [sandbox] debug"));

        engine
    }

    fn create_engine_with_limits(&self) -> Engine {
        let mut engine = self.create_engine();

        let started = Instant::now();
        let max_ops = self.config.max_operations;
        let timeout = Duration::from_millis(self.config.timeout_ms);

        engine.on_progress(move |ops| {
            if ops >= max_ops {
                return Some(Dynamic::from(format!(
                    "Operation limit exceeded: {} operations",
                    max_ops
                )));
            }
            if started.elapsed() > timeout {
                return Some(Dynamic::from(format!(
                    "Timeout exceeded: {} ms",
                    timeout.as_millis()
                )));
            }
            None
        });

        engine
    }

    pub fn compile(&self, script: &str) -> Result<AST> {
        self.create_engine()
            .compile(script)
            .map_err(|e| Error::Sandbox(format!("Compilation error: {}", e)))
    }

    /// `(name, arity)` of every script function defined in `ast`.
    pub fn functions(ast: &AST) -> Vec<(String, usize)> {
        ast.iter_functions()
            .map(|f| (f.name.to_string(), f.params.len()))
            .collect()
    }

    /// Call `function` with JSON arguments in a fresh, limited engine.
    pub fn call(&self, ast: &AST, function: &str, args: &[Value]) -> Result<Value> {
        let engine = self.create_engine_with_limits();
        let started = Instant::now();

        let dyn_args = args
            .iter()
            .map(|a| {
                rhai::serde::to_dynamic(a)
                    .map_err(|e| Error::Sandbox(format!("Invalid argument {}: {}", a, e)))
            })
            .collect::<Result<Vec<Dynamic>>>()?;

        let mut scope = Scope::new();
        let result = engine.call_fn::<Dynamic>(&mut scope, ast, function, dyn_args);

        debug!(
            function = %function,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🧪 [sandbox] call completed"
        );

        match result {
            Ok(value) => rhai::serde::from_dynamic::<Value>(&value)
                .map_err(|e| Error::Sandbox(format!("Unrepresentable result: {}", e))),
            Err(e) => {
                if let EvalAltResult::ErrorTerminated(ref reason, _) = *e {
                    warn!(function = %function, reason = %reason, "🧪 [sandbox] script terminated");
                    return Err(Error::Sandbox(format!("Script terminated: {}", reason)));
                }
                Err(Error::Sandbox(format!("Runtime error: {}", e)))
            }
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_with_json_args() {
        let sandbox = Sandbox::default();
        let ast = sandbox
            .compile("fn greet_user(name) { `Hello, ${name}!` }\nfn add(a, b) { a + b }")
            .unwrap();
        assert_eq!(sandbox.call(&ast, "greet_user", &[json!("Ann")]).unwrap(), json!("Hello, Ann!"));
        assert_eq!(sandbox.call(&ast, "add", &[json!(2), json!(3)]).unwrap(), json!(5));

        let mut fns = Sandbox::functions(&ast);
        fns.sort();
        assert_eq!(fns, vec![("add".to_string(), 2), ("greet_user".to_string(), 1)]);
    }

    #[test]
    fn test_operation_limit() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_operations: 100,
            ..Default::default()
        });
        let ast = sandbox
            .compile("fn spin() { let s = 0; for i in 0..100000 { s += i; } s }")
            .unwrap();
        let err = sandbox.call(&ast, "spin", &[]).unwrap_err().to_string();
        assert!(err.contains("Operation limit") || err.contains("terminated"));
    }

    #[test]
    fn test_eval_and_import_are_unavailable() {
        let sandbox = Sandbox::default();
        let blocked = |script: &str| match sandbox.compile(script) {
            Err(_) => true,
            Ok(ast) => sandbox.call(&ast, "f", &[]).is_err(),
        };
        assert!(blocked("fn f() { eval(\"1\") }"));
        assert!(blocked("fn f() { import \"fs\" as fs; 1 }"));
    }

    #[test]
    fn test_runtime_error_and_missing_function() {
        let sandbox = Sandbox::default();
        let ast = sandbox.compile("fn boom() { throw \"bad\"; }").unwrap();
        assert!(sandbox.call(&ast, "boom", &[]).is_err());
        assert!(sandbox.call(&ast, "nope", &[]).is_err());
        assert!(sandbox.compile("fn broken( {").is_err());
    }
}
