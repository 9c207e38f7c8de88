use chrono::Utc;
use omni_core::{Error, Module, Outcome, Paths, Result, Stage, TmsEntry};
use omni_storage::{write_json_atomic, ModuleStore, TransactionLog};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatch::invoke_module;
use crate::locks::FileLock;
use crate::registry::{CommandRegistry, DispatchTarget, RegistryEntry, RegistryHandle, RegistryStatus};
use crate::sandbox::Sandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationStep {
    Snapshot,
    Register,
    SmokeTest,
    Activate,
}

impl std::fmt::Display for IntegrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntegrationStep::Snapshot => "snapshot",
            IntegrationStep::Register => "register",
            IntegrationStep::SmokeTest => "smoke_test",
            IntegrationStep::Activate => "activate",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationResult {
    Integrated { revision: u64 },
    RolledBack { step: IntegrationStep, reason: String },
}

#[derive(Debug, Clone)]
pub struct IntegrationReport {
    pub result: IntegrationResult,
    pub sequence_ids: Vec<u64>,
}

/// Wires validated modules into the command registry, all-or-nothing.
///
/// The registry lock (in-process mutex plus `registry/registry.lock` across
/// processes) is held for the whole integration, so at most one integration
/// touches the registry at a time; the registry is reloaded from disk once the
/// lock is taken. Every step is logged before the next begins; a failure
/// restores the snapshot taken in the first step.
pub struct IntegrationEngine {
    tms: Arc<TransactionLog>,
    registry: RegistryHandle,
    paths: Paths,
    modules: ModuleStore,
    sandbox: Sandbox,
}

impl IntegrationEngine {
    pub fn new(tms: Arc<TransactionLog>, registry: RegistryHandle, paths: Paths, sandbox: Sandbox) -> Self {
        let modules = ModuleStore::new(paths.clone());
        Self {
            tms,
            registry,
            paths,
            modules,
            sandbox,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    fn log(
        &self,
        ids: &mut Vec<u64>,
        request_id: &str,
        name: &str,
        stage: Stage,
        outcome: Outcome,
        detail: impl Into<String>,
        agent_version: &str,
    ) -> Result<()> {
        let id = self
            .tms
            .append(TmsEntry::new(request_id, name, stage, outcome, detail, agent_version))?;
        ids.push(id);
        Ok(())
    }

    /// Take the cross-process registry lock and refresh `registry` from disk:
    /// another process may have integrated since this one loaded it.
    async fn lock_and_reload(&self, registry: &mut CommandRegistry) -> Result<FileLock> {
        let lock = FileLock::lock(&self.paths.registry_lock_file()).await?;
        *registry = CommandRegistry::load(&self.paths.registry_file())?;
        Ok(lock)
    }

    fn discard_snapshot(&self, request_id: &str) {
        let path = self.paths.snapshot_file(request_id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "🔌 [integrate] failed to remove snapshot");
            }
        }
    }

    pub async fn integrate(&self, request_id: &str, module: &Module, agent_version: &str) -> Result<IntegrationReport> {
        let name = module.capability_name.as_str();
        let mut ids = Vec::new();
        let mut registry = self.registry.lock().await;
        let _file_lock = self.lock_and_reload(&mut registry).await?;

        self.log(&mut ids, request_id, name, Stage::Integrating, Outcome::InProgress, "integration started", agent_version)?;
        info!(capability = %name, request_id = %request_id, "🔌 [integrate] started");

        let snapshot = registry.clone();
        let outcome = self
            .run_steps(&mut registry, &snapshot, &mut ids, request_id, module, agent_version)
            .await;

        let (step, reason) = match outcome {
            Ok(revision) => {
                self.log(
                    &mut ids,
                    request_id,
                    name,
                    Stage::Integrating,
                    Outcome::Success,
                    format!("integrated at registry revision {}", revision),
                    agent_version,
                )?;
                info!(capability = %name, revision, "🔌 [integrate] active");
                self.discard_snapshot(request_id);
                return Ok(IntegrationReport {
                    result: IntegrationResult::Integrated { revision },
                    sequence_ids: ids,
                });
            }
            Err(failure) => failure,
        };

        warn!(capability = %name, step = %step, reason = %reason, "🔌 [integrate] failed, rolling back");
        self.log(
            &mut ids,
            request_id,
            name,
            Stage::Integrating,
            Outcome::Failure,
            format!("IntegrationFailure at {}: {}", step, reason),
            agent_version,
        )?;

        *registry = snapshot.clone();
        registry.save(&self.paths.registry_file())?;
        if !snapshot.entries.contains_key(name) {
            self.modules.remove_promoted(name)?;
        }
        self.log(
            &mut ids,
            request_id,
            name,
            Stage::Integrating,
            Outcome::RolledBack,
            format!("registry restored to revision {}", snapshot.revision),
            agent_version,
        )?;
        self.discard_snapshot(request_id);

        Ok(IntegrationReport {
            result: IntegrationResult::RolledBack { step, reason },
            sequence_ids: ids,
        })
    }

    async fn run_steps(
        &self,
        registry: &mut CommandRegistry,
        snapshot: &CommandRegistry,
        ids: &mut Vec<u64>,
        request_id: &str,
        module: &Module,
        agent_version: &str,
    ) -> std::result::Result<u64, (IntegrationStep, String)> {
        let name = module.capability_name.as_str();
        let fail = |step: IntegrationStep| move |e: Error| (step, e.to_string());

        // (a) 快照
        write_json_atomic(&self.paths.snapshot_file(request_id), snapshot)
            .map_err(fail(IntegrationStep::Snapshot))?;
        self.log(
            ids,
            request_id,
            name,
            Stage::Integrating,
            Outcome::InProgress,
            format!("snapshot taken at registry revision {}", snapshot.revision),
            agent_version,
        )
        .map_err(fail(IntegrationStep::Snapshot))?;

        // (b) 以 incomplete 状态注册
        let entry = RegistryEntry {
            capability_name: name.to_string(),
            dispatch_target: DispatchTarget {
                module_dir: self.modules.module_dir(name),
                entry_function: module.entry_point.clone(),
            },
            status: RegistryStatus::Incomplete,
            request_id: request_id.to_string(),
            registered_at: Utc::now(),
            agent_version: agent_version.to_string(),
        };
        registry
            .register_incomplete(entry)
            .map_err(fail(IntegrationStep::Register))?;
        self.log(ids, request_id, name, Stage::Integrating, Outcome::InProgress, "registered as incomplete", agent_version)
            .map_err(fail(IntegrationStep::Register))?;

        // (c) 冒烟测试：从模块存储重新读取，确认落盘内容可调用；脚本在阻塞线程池里跑
        let detail = match &module.smoke {
            Some(smoke) => {
                let stored = self.modules.load(name).map_err(fail(IntegrationStep::SmokeTest))?;
                let sandbox = self.sandbox.clone();
                let function = smoke.function.clone();
                let args = smoke.args.clone();
                let actual = tokio::task::spawn_blocking(move || invoke_module(&sandbox, &stored, &function, &args))
                    .await
                    .map_err(|e| (IntegrationStep::SmokeTest, format!("smoke test task failed: {}", e)))?
                    .map_err(fail(IntegrationStep::SmokeTest))?;
                if let Some(expected) = &smoke.expected {
                    if &actual != expected {
                        return Err((
                            IntegrationStep::SmokeTest,
                            format!("{} returned {}, expected {}", smoke.function, actual, expected),
                        ));
                    }
                }
                format!("smoke test passed: {}", smoke.function)
            }
            None => "no smoke scenario declared".to_string(),
        };
        self.log(ids, request_id, name, Stage::Integrating, Outcome::InProgress, detail, agent_version)
            .map_err(fail(IntegrationStep::SmokeTest))?;

        // (d) 激活并持久化
        registry
            .set_status(name, RegistryStatus::Active)
            .map_err(fail(IntegrationStep::Activate))?;
        registry
            .save(&self.paths.registry_file())
            .map_err(fail(IntegrationStep::Activate))?;

        Ok(registry.revision)
    }

    /// Undo the interrupted integration of `capability_name` for `request_id`.
    /// Safe to call repeatedly: once a rolled-back entry exists for the
    /// request nothing more happens.
    ///
    /// When the rest of the registry still matches the persisted snapshot the
    /// snapshot is restored as-is. When other capabilities were integrated or
    /// disabled after the snapshot was taken, only `capability_name` is put
    /// back to its snapshot state and those later changes are kept.
    pub async fn rollback(&self, request_id: &str, capability_name: &str, agent_version: &str) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let already = self
            .tms
            .by_request(request_id)?
            .iter()
            .any(|e| e.outcome == Outcome::RolledBack);
        if already {
            info!(request_id = %request_id, "🔌 [integrate] already rolled back");
            self.discard_snapshot(request_id);
            return Ok(ids);
        }

        let mut registry = self.registry.lock().await;
        let _file_lock = self.lock_and_reload(&mut registry).await?;
        let snapshot_path = self.paths.snapshot_file(request_id);
        let restored = if snapshot_path.exists() {
            let snapshot = CommandRegistry::load(&snapshot_path)?;
            let others = |r: &CommandRegistry| {
                let mut entries = r.entries.clone();
                entries.remove(capability_name);
                entries
            };
            if others(&registry) == others(&snapshot) {
                *registry = snapshot;
                format!("registry restored to revision {} from snapshot", registry.revision)
            } else {
                // 快照之后还有别的能力改动过注册表：只恢复本能力这一项
                match snapshot.entries.get(capability_name) {
                    Some(entry) => {
                        registry.entries.insert(capability_name.to_string(), entry.clone());
                    }
                    None => {
                        registry.entries.remove(capability_name);
                    }
                }
                registry.revision += 1;
                format!(
                    "'{}' restored from snapshot revision {}; later registry changes kept at revision {}",
                    capability_name, snapshot.revision, registry.revision
                )
            }
        } else {
            // 快照之前就中断了：磁盘上的注册表没动过，只清理可能残留的条目
            let stale = registry
                .get(capability_name)
                .map(|e| e.request_id == request_id)
                .unwrap_or(false);
            if stale {
                registry.entries.remove(capability_name);
            }
            "no snapshot recorded; registry left as persisted".to_string()
        };
        registry.save(&self.paths.registry_file())?;
        if !registry.entries.contains_key(capability_name) {
            self.modules.remove_promoted(capability_name)?;
        }

        self.log(
            &mut ids,
            request_id,
            capability_name,
            Stage::Integrating,
            Outcome::RolledBack,
            restored,
            agent_version,
        )?;
        self.discard_snapshot(request_id);
        warn!(capability = %capability_name, request_id = %request_id, "🔌 [integrate] recovered by rollback");
        Ok(ids)
    }

    /// Take an active command out of dispatch without deleting its module.
    pub async fn disable(&self, capability_name: &str, agent_version: &str) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut registry = self.registry.lock().await;
        let _file_lock = self.lock_and_reload(&mut registry).await?;
        let entry = registry
            .get(capability_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no acquired command '{}'", capability_name)))?;
        if entry.status != RegistryStatus::Active {
            return Err(Error::Other(format!("command '{}' is {}", capability_name, entry.status)));
        }

        let request_id = entry.request_id.as_str();
        self.log(&mut ids, request_id, capability_name, Stage::Disabling, Outcome::InProgress, "disable requested", agent_version)?;

        let before = registry.clone();
        let saved = registry
            .set_status(capability_name, RegistryStatus::Disabled)
            .and_then(|_| registry.save(&self.paths.registry_file()));
        if let Err(e) = saved {
            error!(capability = %capability_name, error = %e, "🔌 [disable] failed");
            *registry = before;
            self.log(
                &mut ids,
                request_id,
                capability_name,
                Stage::Disabling,
                Outcome::Failure,
                format!("{}: {}", e.kind(), e),
                agent_version,
            )?;
            return Err(e);
        }

        self.log(&mut ids, request_id, capability_name, Stage::Disabling, Outcome::Success, "disabled", agent_version)?;
        info!(capability = %capability_name, "🔌 [disable] done");
        Ok(ids)
    }
}
