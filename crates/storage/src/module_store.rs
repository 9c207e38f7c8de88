use chrono::{DateTime, Utc};
use omni_core::{Error, Module, Paths, Result, Scenario, SourceArtifact, ValidationResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::atomic::{write_atomic, write_json_atomic};

const MANIFEST_FILE: &str = "module.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub function: String,
    pub file: String,
    pub sha256: String,
}

/// `module.json`: everything about a module except the script bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub capability_name: String,
    pub entry_point: String,
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke: Option<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
    pub stored_at: DateTime<Utc>,
}

pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 模块存储：未验证的模块在 `.staging/<name>/`，验证通过后才提升到 `modules/<name>/`
pub struct ModuleStore {
    paths: Paths,
}

impl ModuleStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Write a freshly synthesized module to the staging area, replacing any previous attempt.
    pub fn stage(&self, module: &Module) -> Result<PathBuf> {
        let dir = self.paths.staged_module_dir(&module.capability_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        write_module(&dir, module)?;
        info!(
            capability = %module.capability_name,
            artifacts = module.source_artifacts.len(),
            "📦 [modules] staged"
        );
        Ok(dir)
    }

    pub fn load_staged(&self, capability_name: &str) -> Result<Module> {
        read_module(&self.paths.staged_module_dir(capability_name))
    }

    pub fn has_staged(&self, capability_name: &str) -> bool {
        self.paths
            .staged_module_dir(capability_name)
            .join(MANIFEST_FILE)
            .exists()
    }

    /// Move a validated module out of staging. Refuses modules that did not pass validation.
    pub fn promote(&self, module: &Module) -> Result<PathBuf> {
        if !module.is_validated() {
            return Err(Error::Storage(format!(
                "module '{}' has not passed validation",
                module.capability_name
            )));
        }

        let staged = self.paths.staged_module_dir(&module.capability_name);
        // 带上验证结果重写 manifest
        write_module(&staged, module)?;

        let target = self.paths.module_dir(&module.capability_name);
        if target.exists() {
            warn!(capability = %module.capability_name, "📦 [modules] replacing existing promoted module");
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&staged, &target)
            .map_err(|e| Error::Storage(format!("promote {}: {}", module.capability_name, e)))?;

        info!(capability = %module.capability_name, dir = %target.display(), "📦 [modules] promoted");
        Ok(target)
    }

    pub fn load(&self, capability_name: &str) -> Result<Module> {
        read_module(&self.paths.module_dir(capability_name))
    }

    pub fn is_promoted(&self, capability_name: &str) -> bool {
        self.paths
            .module_dir(capability_name)
            .join(MANIFEST_FILE)
            .exists()
    }

    pub fn discard_staged(&self, capability_name: &str) -> Result<()> {
        let dir = self.paths.staged_module_dir(capability_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Drop a promoted module that never made it into the registry.
    pub fn remove_promoted(&self, capability_name: &str) -> Result<()> {
        let dir = self.paths.module_dir(capability_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            info!(capability = %capability_name, "📦 [modules] promoted module removed");
        }
        Ok(())
    }

    pub fn module_dir(&self, capability_name: &str) -> PathBuf {
        self.paths.module_dir(capability_name)
    }
}

fn write_module(dir: &Path, module: &Module) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut artifacts = Vec::with_capacity(module.source_artifacts.len());
    for artifact in &module.source_artifacts {
        let file = format!("{}.rhai", artifact.function);
        write_atomic(&dir.join(&file), artifact.source.as_bytes())?;
        artifacts.push(ArtifactRecord {
            function: artifact.function.clone(),
            file,
            sha256: sha256_hex(&artifact.source),
        });
    }

    let manifest = ModuleManifest {
        capability_name: module.capability_name.clone(),
        entry_point: module.entry_point.clone(),
        artifacts,
        scenarios: module.scenarios.clone(),
        smoke: module.smoke.clone(),
        validation_result: module.validation_result.clone(),
        stored_at: Utc::now(),
    };
    // manifest 最后写入：它的存在代表模块完整
    write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)
}

fn read_module(dir: &Path) -> Result<Module> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(Error::NotFound(format!("module at {}", dir.display())));
    }
    let manifest: ModuleManifest = serde_json::from_str(&std::fs::read_to_string(&manifest_path)?)
        .map_err(|e| Error::Storage(format!("corrupt manifest {}: {}", manifest_path.display(), e)))?;

    let mut source_artifacts = Vec::with_capacity(manifest.artifacts.len());
    for record in &manifest.artifacts {
        let source = std::fs::read_to_string(dir.join(&record.file))?;
        if sha256_hex(&source) != record.sha256 {
            return Err(Error::Storage(format!(
                "artifact {} of '{}' does not match its recorded hash",
                record.file, manifest.capability_name
            )));
        }
        source_artifacts.push(SourceArtifact {
            function: record.function.clone(),
            source,
        });
    }

    Ok(Module {
        capability_name: manifest.capability_name,
        entry_point: manifest.entry_point,
        source_artifacts,
        scenarios: manifest.scenarios,
        smoke: manifest.smoke,
        validation_result: manifest.validation_result,
    })
}
