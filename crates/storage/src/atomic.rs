use omni_core::{Error, Result};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// 原子写入：先写同目录临时文件并 fsync，再 rename 覆盖目标
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Storage(format!("invalid file name: {}", path.display())))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        // rename 失败时清理临时文件
        let _ = std::fs::remove_file(&tmp_path);
        Error::Storage(format!("atomic rename to {} failed: {}", path.display(), e))
    })?;

    debug!(path = %path.display(), bytes = bytes.len(), "Atomic write complete");
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}
