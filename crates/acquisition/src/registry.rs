use chrono::{DateTime, Utc};
use omni_core::{Error, Result};
use omni_storage::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Commands the agent ships with; capability names may never shadow them.
pub const BUILTIN_COMMANDS: &[&str] = &[
    "help",
    "add",
    "add_mcp_tool",
    "resume",
    "status",
    "cancel",
    "show_transactions",
    "show_plan",
    "list",
    "run",
    "disable",
    "version",
];

pub fn is_builtin_command(name: &str) -> bool {
    let normalized = name.replace('-', "_").to_lowercase();
    BUILTIN_COMMANDS.contains(&normalized.as_str())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    Active,
    Disabled,
    Incomplete,
}

impl std::fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistryStatus::Active => "active",
            RegistryStatus::Disabled => "disabled",
            RegistryStatus::Incomplete => "incomplete",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchTarget {
    pub module_dir: PathBuf,
    pub entry_function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub capability_name: String,
    pub dispatch_target: DispatchTarget,
    pub status: RegistryStatus,
    pub request_id: String,
    pub registered_at: DateTime<Utc>,
    pub agent_version: String,
}

/// The agent's live command surface: built-ins plus acquired capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommandRegistry {
    pub revision: u64,
    pub entries: BTreeMap<String, RegistryEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动时从 registry.json 加载；文件不存在则为空注册表
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let registry: CommandRegistry = serde_json::from_str(&content)
            .map_err(|e| Error::Storage(format!("corrupt registry {}: {}", path.display(), e)))?;
        info!(
            revision = registry.revision,
            entries = registry.entries.len(),
            "🔌 [registry] loaded"
        );
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        debug!(revision = self.revision, "🔌 [registry] saved");
        Ok(())
    }

    /// True when `name` is taken by a built-in or by any entry, whatever its status.
    pub fn contains(&self, name: &str) -> bool {
        is_builtin_command(name) || self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn list(&self) -> Vec<&RegistryEntry> {
        self.entries.values().collect()
    }

    pub fn register_incomplete(&mut self, entry: RegistryEntry) -> Result<()> {
        if is_builtin_command(&entry.capability_name) {
            return Err(Error::Integration(format!(
                "'{}' is a built-in command",
                entry.capability_name
            )));
        }
        let mut entry = entry;
        entry.status = RegistryStatus::Incomplete;
        self.entries.insert(entry.capability_name.clone(), entry);
        self.revision += 1;
        Ok(())
    }

    pub fn set_status(&mut self, name: &str, status: RegistryStatus) -> Result<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("registry entry '{}'", name)))?;
        entry.status = status;
        self.revision += 1;
        Ok(())
    }
}

/// 全局唯一的注册表句柄；持有锁即处于集成临界区
pub type RegistryHandle = Arc<Mutex<CommandRegistry>>;

pub fn new_registry_handle(registry: CommandRegistry) -> RegistryHandle {
    Arc::new(Mutex::new(registry))
}
