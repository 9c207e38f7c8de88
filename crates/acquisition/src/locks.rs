use omni_core::{validate_capability_name, Error, LockPolicy, Result};
use rusqlite::{Connection, ErrorCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// 排队等待其他进程释放锁文件的轮询间隔
const FILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

type SlotTable = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Cross-process exclusive lock: a SQLite file held in an open
/// `BEGIN EXCLUSIVE` transaction. Released on drop, or by the OS when the
/// holding process exits.
pub struct FileLock {
    _conn: Connection,
}

impl FileLock {
    /// `None` when another holder has the file.
    pub fn try_lock(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create lock directory: {}", e)))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open lock file {}: {}", path.display(), e)))?;
        conn.busy_timeout(Duration::ZERO)
            .map_err(|e| Error::Storage(format!("Failed to configure lock file: {}", e)))?;

        match conn.execute_batch("BEGIN EXCLUSIVE") {
            Ok(()) => Ok(Some(Self { _conn: conn })),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Storage(format!(
                "Failed to lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Polls until the file is free.
    pub async fn lock(path: &Path) -> Result<Self> {
        loop {
            if let Some(lock) = Self::try_lock(path)? {
                return Ok(lock);
            }
            tokio::time::sleep(FILE_POLL_INTERVAL).await;
        }
    }
}

/// 每个能力名一把锁：同名请求互斥，不同名并行。
///
/// Two layers: a tokio mutex per name serialises workflows inside this
/// process, and `<locks_dir>/<name>.lock` (a SQLite file held in an open
/// `BEGIN EXCLUSIVE` transaction) excludes other processes sharing the same
/// home directory. The OS drops the file lock when the holder exits, so a
/// crashed run never leaves a stale lock behind.
pub struct CapabilityLocks {
    dir: PathBuf,
    table: SlotTable,
}

/// Held for the whole workflow; dropping it releases the name.
pub struct CapabilityGuard {
    name: String,
    file: Option<FileLock>,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<Mutex<()>>,
    table: SlotTable,
}

impl CapabilityGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CapabilityGuard {
    fn drop(&mut self) {
        // 先放文件锁，再放进程内锁：同进程的下一个等待者拿到槽位时文件锁已空闲
        self.file.take();
        self.guard.take();

        let mut table = match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        // 表里一份 + 本 guard 一份：没有其他持有者或等待者
        let idle = table
            .get(&self.name)
            .map_or(false, |slot| Arc::ptr_eq(slot, &self.slot))
            && Arc::strong_count(&self.slot) == 2;
        if idle {
            table.remove(&self.name);
        }
        debug!(capability = %self.name, "🔒 [locks] released");
    }
}

impl CapabilityLocks {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            table: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn slot(&self, name: &str) -> Arc<Mutex<()>> {
        let mut table = match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn busy(name: &str) -> Error {
        Error::Busy(format!("a workflow for '{}' is already in progress", name))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    fn guard(&self, name: &str, slot: Arc<Mutex<()>>, guard: OwnedMutexGuard<()>, file: FileLock) -> CapabilityGuard {
        CapabilityGuard {
            name: name.to_string(),
            file: Some(file),
            guard: Some(guard),
            slot,
            table: self.table.clone(),
        }
    }

    /// Fails with `Busy` when another workflow, in this process or another
    /// one, holds `name`.
    pub fn try_acquire(&self, name: &str) -> Result<CapabilityGuard> {
        validate_capability_name(name)?;

        let slot = self.slot(name);
        let guard = match slot.clone().try_lock_owned() {
            Ok(g) => g,
            Err(_) => {
                drop(slot);
                self.forget_if_idle(name);
                return Err(Self::busy(name));
            }
        };

        match FileLock::try_lock(&self.lock_path(name)) {
            Ok(Some(file)) => {
                debug!(capability = %name, "🔒 [locks] acquired");
                Ok(self.guard(name, slot, guard, file))
            }
            Ok(None) => {
                debug!(capability = %name, "🔒 [locks] held by another process");
                drop(guard);
                drop(slot);
                self.forget_if_idle(name);
                Err(Self::busy(name))
            }
            Err(e) => {
                drop(guard);
                drop(slot);
                self.forget_if_idle(name);
                Err(e)
            }
        }
    }

    /// Waits until `name` is free: FIFO among tasks of this process, then
    /// polling for holders in other processes.
    pub async fn acquire(&self, name: &str) -> Result<CapabilityGuard> {
        validate_capability_name(name)?;

        let slot = self.slot(name);
        let guard = slot.clone().lock_owned().await;

        loop {
            match FileLock::try_lock(&self.lock_path(name)) {
                Ok(Some(file)) => {
                    debug!(capability = %name, "🔒 [locks] acquired after wait");
                    return Ok(self.guard(name, slot, guard, file));
                }
                Ok(None) => tokio::time::sleep(FILE_POLL_INTERVAL).await,
                Err(e) => {
                    drop(guard);
                    drop(slot);
                    self.forget_if_idle(name);
                    return Err(e);
                }
            }
        }
    }

    pub async fn acquire_with_policy(&self, name: &str, policy: LockPolicy) -> Result<CapabilityGuard> {
        match policy {
            LockPolicy::Reject => self.try_acquire(name),
            LockPolicy::Queue => self.acquire(name).await,
        }
    }

    /// Held by a workflow of this process.
    pub fn is_held(&self, name: &str) -> bool {
        let table = match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        table
            .get(name)
            .map_or(false, |slot| slot.try_lock().is_err())
    }

    fn forget_if_idle(&self, name: &str) {
        let mut table = match self.table.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if table.get(name).map_or(false, |slot| Arc::strong_count(slot) == 1) {
            table.remove(name);
        }
    }

    #[cfg(test)]
    fn slots(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locks(tmp: &tempfile::TempDir) -> CapabilityLocks {
        CapabilityLocks::new(tmp.path().join("locks"))
    }

    #[test]
    fn test_reject_same_name_allow_other() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = locks(&tmp);
        let g = locks.try_acquire("greet").unwrap();
        assert_eq!(g.name(), "greet");
        assert!(matches!(locks.try_acquire("greet"), Err(Error::Busy(_))));
        assert!(locks.try_acquire("weather").is_ok());
        assert!(locks.is_held("greet"));
        drop(g);
        assert!(!locks.is_held("greet"));
        assert!(locks.try_acquire("greet").is_ok());
    }

    #[test]
    fn test_rejects_invalid_name_before_touching_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = locks(&tmp);
        assert!(matches!(
            locks.try_acquire("../escape"),
            Err(Error::RequestValidation(_))
        ));
        assert!(!tmp.path().join("locks").exists());
    }

    #[test]
    fn test_second_table_on_same_dir_is_excluded() {
        // 两个独立的锁表（等同两个进程）共享同一目录
        let tmp = tempfile::TempDir::new().unwrap();
        let here = locks(&tmp);
        let there = locks(&tmp);

        let g = here.try_acquire("greet").unwrap();
        assert!(matches!(there.try_acquire("greet"), Err(Error::Busy(_))));
        assert!(there.try_acquire("weather").is_ok());
        drop(g);
        assert!(there.try_acquire("greet").is_ok());
    }

    #[test]
    fn test_table_shrinks_after_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = locks(&tmp);
        for i in 0..20 {
            let g = locks.try_acquire(&format!("cap_{}", i)).unwrap();
            drop(g);
        }
        assert_eq!(locks.slots(), 0);

        let _held = locks.try_acquire("greet").unwrap();
        assert!(locks.try_acquire("greet").is_err());
        assert!(!locks.is_held("nothing"));
        assert_eq!(locks.slots(), 1);
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locks = Arc::new(locks(&tmp));
        let g = locks.acquire_with_policy("greet", LockPolicy::Queue).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire_with_policy("greet", LockPolicy::Queue).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(g);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(locks.slots(), 0);
    }

    #[tokio::test]
    async fn test_queue_waits_for_other_process() {
        let tmp = tempfile::TempDir::new().unwrap();
        let other = locks(&tmp);
        let held = other.try_acquire("greet").unwrap();

        let here = Arc::new(locks(&tmp));
        let waiter = {
            let here = here.clone();
            tokio::spawn(async move { here.acquire("greet").await.map(|g| g.name().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());
        drop(held);
        let name = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(name, "greet");
    }
}
