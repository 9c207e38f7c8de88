use chrono::{DateTime, SecondsFormat, Utc};
use omni_core::{Error, Outcome, Paths, Result, Stage, TmsEntry};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// 其他进程持有写锁时的最长等待
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "SELECT sequence_id, timestamp, request_id, capability_name, stage, outcome, detail, agent_version FROM transactions";

/// Append-only transaction log backed by SQLite.
///
/// Sequence ids come from an AUTOINCREMENT key, so several processes
/// appending to the same database never hand out the same id and never
/// reuse one. Every append commits with `synchronous=FULL` before it returns.
pub struct TransactionLog {
    path: PathBuf,
    inner: Mutex<Connection>,
}

impl TransactionLog {
    pub fn open(paths: &Paths) -> Result<Self> {
        Self::open_at(&paths.tms_file())
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create transaction log directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open transaction log: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {}", e)))?;

        // WAL 允许读写并发；FULL 保证提交即落盘
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| Error::Storage(format!("Failed to configure transaction log: {}", e)))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS transactions (
                sequence_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp       TEXT NOT NULL,
                request_id      TEXT NOT NULL,
                capability_name TEXT NOT NULL,
                stage           TEXT NOT NULL,
                outcome         TEXT NOT NULL,
                detail          TEXT NOT NULL DEFAULT '',
                agent_version   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_capability ON transactions(capability_name);
            CREATE INDEX IF NOT EXISTS idx_transactions_request ON transactions(request_id);
            ",
        )
        .map_err(|e| Error::Storage(format!("Failed to init transaction log schema: {}", e)))?;

        debug!(path = %path.display(), "📒 [tms] opened");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条记录，返回分配的 sequence_id。写入失败视为致命错误。
    pub fn append(&self, mut entry: TmsEntry) -> Result<u64> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO transactions (timestamp, request_id, capability_name, stage, outcome, detail, agent_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                entry.request_id,
                entry.capability_name,
                entry.stage.as_str(),
                entry.outcome.as_str(),
                entry.detail,
                entry.agent_version,
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to append transaction: {}", e)))?;

        entry.sequence_id = conn.last_insert_rowid() as u64;

        debug!(
            seq = entry.sequence_id,
            capability = %entry.capability_name,
            stage = %entry.stage,
            outcome = %entry.outcome,
            "📒 [tms] append"
        );
        Ok(entry.sequence_id)
    }

    pub fn all(&self) -> Result<Vec<TmsEntry>> {
        self.select(&format!("{} ORDER BY sequence_id", SELECT_COLUMNS), &[])
    }

    /// Entries for one capability, ordered by sequence id.
    pub fn query(&self, capability_name: &str) -> Result<Vec<TmsEntry>> {
        self.select(
            &format!("{} WHERE capability_name = ?1 ORDER BY sequence_id", SELECT_COLUMNS),
            &[&capability_name],
        )
    }

    /// Entries whose sequence id lies in `[from, to]`.
    pub fn query_range(&self, from: u64, to: u64) -> Result<Vec<TmsEntry>> {
        let from = from.min(i64::MAX as u64) as i64;
        let to = to.min(i64::MAX as u64) as i64;
        self.select(
            &format!(
                "{} WHERE sequence_id >= ?1 AND sequence_id <= ?2 ORDER BY sequence_id",
                SELECT_COLUMNS
            ),
            &[&from, &to],
        )
    }

    pub fn by_request(&self, request_id: &str) -> Result<Vec<TmsEntry>> {
        self.select(
            &format!("{} WHERE request_id = ?1 ORDER BY sequence_id", SELECT_COLUMNS),
            &[&request_id],
        )
    }

    pub fn last_for(&self, capability_name: &str) -> Result<Option<TmsEntry>> {
        Ok(self
            .select(
                &format!(
                    "{} WHERE capability_name = ?1 ORDER BY sequence_id DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                &[&capability_name],
            )?
            .pop())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn select(&self, sql: &str, args: &[&dyn rusqlite::types::ToSql]) -> Result<Vec<TmsEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;

        let rows = stmt
            .query_map(args, row_to_entry)
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        let mut entries = Vec::new();
        for row in rows {
            match row {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "📒 [tms] error reading row"),
            }
        }
        Ok(entries)
    }
}

/// 无法识别的 stage/outcome 行跳过，不影响回放
fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Option<TmsEntry>> {
    let sequence_id: i64 = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let stage: String = row.get(4)?;
    let outcome: String = row.get(5)?;

    let (Some(stage), Some(outcome)) = (Stage::from_str(&stage), Outcome::from_str(&outcome)) else {
        warn!(seq = sequence_id, stage = %stage, outcome = %outcome, "📒 [tms] skipping unreadable row");
        return Ok(None);
    };

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(seq = sequence_id, error = %e, "📒 [tms] bad timestamp");
            DateTime::<Utc>::default()
        });

    Ok(Some(TmsEntry {
        sequence_id: sequence_id as u64,
        timestamp,
        request_id: row.get(2)?,
        capability_name: row.get(3)?,
        stage,
        outcome,
        detail: row.get(6)?,
        agent_version: row.get(7)?,
    }))
}
