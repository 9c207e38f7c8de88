use omni_core::{Error, Paths, Plan, Result};
use tracing::{debug, info};

use crate::atomic::write_json_atomic;

/// Plans on disk at `capabilities/plans/<name>_plan.json`, one current plan per name.
pub struct PlanStore {
    paths: Paths,
}

impl PlanStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// 覆盖已有计划前，调用方必须先写一条 supersession TMS 记录
    pub fn save(&self, plan: &Plan) -> Result<()> {
        let path = self.paths.plan_file(&plan.capability_name);
        write_json_atomic(&path, plan)?;
        info!(
            capability = %plan.capability_name,
            functions = plan.proposed_functions.len(),
            "🗂️ [plans] plan saved"
        );
        Ok(())
    }

    pub fn load(&self, capability_name: &str) -> Result<Plan> {
        let path = self.paths.plan_file(capability_name);
        if !path.exists() {
            return Err(Error::NotFound(format!("plan for '{}'", capability_name)));
        }
        let content = std::fs::read_to_string(&path)?;
        let plan: Plan = serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("corrupt plan {}: {}", path.display(), e)))?;
        Ok(plan)
    }

    pub fn exists(&self, capability_name: &str) -> bool {
        self.paths.plan_file(capability_name).exists()
    }

    /// Capability names with a stored plan, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.paths.plans_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix("_plan.json") {
                names.push(name.to_string());
            }
        }
        names.sort();
        debug!(count = names.len(), "🗂️ [plans] listed");
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::{CliIntegration, FunctionSpec, ParameterSpec};

    fn sample_plan(name: &str, first_fn: &str) -> Plan {
        Plan {
            capability_name: name.to_string(),
            kind: Default::default(),
            mcp_config: None,
            purpose: "Say hello".to_string(),
            proposed_functions: vec![FunctionSpec {
                name: first_fn.to_string(),
                role: "greets".to_string(),
                parameters: vec![ParameterSpec {
                    name: "who".to_string(),
                    ty: "string".to_string(),
                }],
                returns: "string".to_string(),
            }],
            cli_integration: CliIntegration {
                command_template: format!("{} <who>", name),
                arguments: vec![],
            },
            required_libraries: Default::default(),
            dispatch_modifications: vec![],
            error_handling_notes: vec![],
            storage_notes: vec![],
            security_notes: vec![],
            testing_notes: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_save_load_overwrite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = PlanStore::new(Paths::with_base(tmp.path().to_path_buf()));

        assert!(matches!(store.load("greet"), Err(Error::NotFound(_))));
        store.save(&sample_plan("greet", "greet_user")).unwrap();
        assert!(store.exists("greet"));
        assert_eq!(store.load("greet").unwrap().proposed_functions[0].name, "greet_user");

        store.save(&sample_plan("greet", "say_hi")).unwrap();
        assert_eq!(store.load("greet").unwrap().proposed_functions[0].name, "say_hi");
    }

    #[test]
    fn test_list() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = PlanStore::new(Paths::with_base(tmp.path().to_path_buf()));
        assert!(store.list().unwrap().is_empty());
        store.save(&sample_plan("zeta", "z")).unwrap();
        store.save(&sample_plan("alpha", "a")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["alpha", "zeta"]);
    }
}
