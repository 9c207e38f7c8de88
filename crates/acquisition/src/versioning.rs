use async_trait::async_trait;
use chrono::{DateTime, Utc};
use omni_core::{Error, Result};
use omni_storage::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

/// Told about every successful integration; owns the agent's version number.
#[async_trait]
pub trait VersionNotifier: Send + Sync {
    fn current_version(&self) -> String;

    /// Returns the agent version after the bump. Must be idempotent per
    /// `(capability, agent_version)` pair so a resumed workflow can re-fire it.
    async fn capability_integrated(&self, capability_name: &str, agent_version: &str) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord {
    pub capability_name: String,
    pub from_version: String,
    pub to_version: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionFile {
    pub current: String,
    #[serde(default)]
    pub history: Vec<VersionRecord>,
}

impl Default for VersionFile {
    fn default() -> Self {
        Self {
            current: env!("CARGO_PKG_VERSION").to_string(),
            history: Vec::new(),
        }
    }
}

/// 版本号落盘在 version.json；每集成一个能力 minor +1
pub struct FileVersioning {
    path: PathBuf,
    state: Mutex<VersionFile>,
}

impl FileVersioning {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Storage(format!("corrupt {}: {}", path.display(), e)))?
        } else {
            VersionFile::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn history(&self) -> Vec<VersionRecord> {
        self.lock().history.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VersionFile> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub fn bump_minor(version: &str) -> Result<String> {
    let parts: Vec<u64> = version
        .split('.')
        .map(|p| p.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Other(format!("invalid version '{}'", version)))?;
    match parts.as_slice() {
        [major, minor, _patch] => Ok(format!("{}.{}.0", major, minor + 1)),
        _ => Err(Error::Other(format!("invalid version '{}'", version))),
    }
}

#[async_trait]
impl VersionNotifier for FileVersioning {
    fn current_version(&self) -> String {
        self.lock().current.clone()
    }

    async fn capability_integrated(&self, capability_name: &str, agent_version: &str) -> Result<String> {
        let mut state = self.lock();
        if let Some(done) = state
            .history
            .iter()
            .find(|r| r.capability_name == capability_name && r.from_version == agent_version)
        {
            return Ok(done.to_version.clone());
        }

        let next = bump_minor(&state.current)?;
        let mut updated = state.clone();
        updated.history.push(VersionRecord {
            capability_name: capability_name.to_string(),
            from_version: agent_version.to_string(),
            to_version: next.clone(),
            at: Utc::now(),
        });
        updated.current = next.clone();
        write_json_atomic(&self.path, &updated)?;
        *state = updated;

        info!(capability = %capability_name, version = %next, "🏷️ [version] bumped");
        Ok(next)
    }
}
