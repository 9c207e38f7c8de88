use std::path::PathBuf;

/// Filesystem layout of an omni installation.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    /// `$OMNI_HOME` if set, otherwise `~/.omni`.
    pub fn new() -> Self {
        if let Ok(home) = std::env::var("OMNI_HOME") {
            if !home.trim().is_empty() {
                return Self { base: PathBuf::from(home) };
            }
        }
        let base = dirs::home_dir()
            .map(|h| h.join(".omni"))
            .unwrap_or_else(|| PathBuf::from(".omni"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn tms_dir(&self) -> PathBuf {
        self.base.join("tms")
    }

    pub fn tms_file(&self) -> PathBuf {
        self.tms_dir().join("transactions.db")
    }

    /// 每个能力名一个锁文件，跨进程互斥
    pub fn locks_dir(&self) -> PathBuf {
        self.base.join("locks")
    }

    pub fn lock_file(&self, capability_name: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", capability_name))
    }

    pub fn capabilities_dir(&self) -> PathBuf {
        self.base.join("capabilities")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.capabilities_dir().join("plans")
    }

    pub fn plan_file(&self, capability_name: &str) -> PathBuf {
        self.plans_dir().join(format!("{}_plan.json", capability_name))
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.capabilities_dir().join("modules")
    }

    pub fn module_dir(&self, capability_name: &str) -> PathBuf {
        self.modules_dir().join(capability_name)
    }

    /// 未通过验证的模块只存在于 staging 目录
    pub fn staging_dir(&self) -> PathBuf {
        self.modules_dir().join(".staging")
    }

    pub fn staged_module_dir(&self, capability_name: &str) -> PathBuf {
        self.staging_dir().join(capability_name)
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.base.join("registry")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.registry_dir().join("registry.json")
    }

    /// 跨进程的注册表写锁
    pub fn registry_lock_file(&self) -> PathBuf {
        self.registry_dir().join("registry.lock")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.registry_dir().join("snapshots")
    }

    pub fn snapshot_file(&self, request_id: &str) -> PathBuf {
        self.snapshots_dir().join(format!("{}.json", request_id))
    }

    pub fn version_file(&self) -> PathBuf {
        self.base.join("version.json")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.tms_dir())?;
        std::fs::create_dir_all(self.plans_dir())?;
        std::fs::create_dir_all(self.modules_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.registry_dir())?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        std::fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = Paths::with_base(PathBuf::from("/tmp/omni-test"));
        assert_eq!(
            paths.plan_file("minio_browser"),
            PathBuf::from("/tmp/omni-test/capabilities/plans/minio_browser_plan.json")
        );
        assert_eq!(
            paths.staged_module_dir("greet"),
            PathBuf::from("/tmp/omni-test/capabilities/modules/.staging/greet")
        );
        assert_eq!(
            paths.snapshot_file("abc"),
            PathBuf::from("/tmp/omni-test/registry/snapshots/abc.json")
        );
        assert_eq!(
            paths.lock_file("greet"),
            PathBuf::from("/tmp/omni-test/locks/greet.lock")
        );
    }

    #[test]
    fn test_ensure_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(tmp.path().join("home"));
        paths.ensure_dirs().unwrap();
        assert!(paths.tms_dir().is_dir());
        assert!(paths.staging_dir().is_dir());
        assert!(paths.snapshots_dir().is_dir());
        assert!(paths.locks_dir().is_dir());
    }
}
