//! Persistence for mount records and sync jobs.
//!
//! The registry and sync service talk to the [`MountStore`] and
//! [`SyncJobStore`] traits; [`SqliteStore`] is the production implementation
//! and [`MemoryStore`] backs tests and embedded use.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::sync::SyncMode;

/// Persistence error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Auto-reconnect settings of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReconnect {
    pub enabled: bool,
    /// Base retry interval; the scheduler never goes below its floor.
    pub initial_interval_secs: u64,
    /// Attempts before giving up. 0 means unbounded.
    pub max_attempts: u32,
}

impl Default for AutoReconnect {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_interval_secs: 30,
            max_attempts: 5,
        }
    }
}

/// A persisted mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Row id; 0 until the record has been stored.
    pub id: u64,
    pub mount_path: String,
    /// Driver name, as registered in the driver factory.
    pub driver: String,
    /// Driver-specific settings, JSON.
    pub addition: String,
    pub order: i32,
    /// Free text. A first line of the form `ref:/path` chains to another mount.
    pub remark: String,
    pub disabled: bool,
    pub auto_reconnect: AutoReconnect,
    /// `work`, `disabled`, or an error message.
    pub status: String,
    /// Unix seconds.
    pub modified: i64,
}

impl StorageRecord {
    pub fn new(mount_path: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            id: 0,
            mount_path: mount_path.into(),
            driver: driver.into(),
            addition: "{}".to_string(),
            order: 0,
            remark: String::new(),
            disabled: false,
            auto_reconnect: AutoReconnect::default(),
            status: String::new(),
            modified: now_secs(),
        }
    }

    pub fn with_addition(mut self, addition: impl Into<String>) -> Self {
        self.addition = addition.into();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: AutoReconnect) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Referenced mount path, if the remark asks for reference chaining.
    pub fn reference_path(&self) -> Option<&str> {
        let first = self.remark.lines().next()?.trim();
        let target = first.strip_prefix("ref:")?.trim();
        target.starts_with('/').then_some(target)
    }
}

/// A stored sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub task_name: String,
    pub src_path: String,
    pub dst_path: String,
    pub mode: SyncMode,
    /// Trust cached listings while walking.
    pub lazy_cache: bool,
}

/// Current time in unix seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Store traits
// ============================================================================

/// Mount record persistence.
pub trait MountStore: Send + Sync {
    /// Insert a record and return its new id. Mount paths are unique.
    fn create_storage(&self, record: &StorageRecord) -> StoreResult<u64>;
    fn update_storage(&self, record: &StorageRecord) -> StoreResult<()>;
    fn get_storage(&self, id: u64) -> StoreResult<Option<StorageRecord>>;
    fn delete_storage(&self, id: u64) -> StoreResult<()>;
    /// All records ordered by `order`, then id.
    fn list_storages(&self) -> StoreResult<Vec<StorageRecord>>;
}

/// Sync job persistence.
pub trait SyncJobStore: Send + Sync {
    fn create_sync_job(&self, job: &SyncJob) -> StoreResult<()>;
    fn update_sync_job(&self, job: &SyncJob) -> StoreResult<()>;
    fn delete_sync_job(&self, id: &str) -> StoreResult<()>;
    fn get_sync_job(&self, id: &str) -> StoreResult<Option<SyncJob>>;
    /// One page (1-based) of jobs ordered by name, plus the total count.
    fn list_sync_jobs(&self, page: usize, per_page: usize) -> StoreResult<(Vec<SyncJob>, usize)>;
}

// ============================================================================
// SQLite
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storages (
    id INTEGER PRIMARY KEY,
    mount_path TEXT NOT NULL UNIQUE,
    driver TEXT NOT NULL,
    addition TEXT NOT NULL DEFAULT '{}',
    sort_order INTEGER NOT NULL DEFAULT 0,
    remark TEXT NOT NULL DEFAULT '',
    disabled INTEGER NOT NULL DEFAULT 0,
    reconnect_enabled INTEGER NOT NULL DEFAULT 0,
    reconnect_interval INTEGER NOT NULL DEFAULT 30,
    reconnect_max_attempts INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT '',
    modified INTEGER NOT NULL DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS sync_jobs (
    id TEXT PRIMARY KEY,
    task_name TEXT NOT NULL,
    src_path TEXT NOT NULL,
    dst_path TEXT NOT NULL,
    mode TEXT NOT NULL,
    lazy_cache INTEGER NOT NULL DEFAULT 0
);
"#;

const STORAGE_COLUMNS: &str = "id, mount_path, driver, addition, sort_order, remark, disabled, \
     reconnect_enabled, reconnect_interval, reconnect_max_attempts, status, modified";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_storage(row: &rusqlite::Row<'_>) -> rusqlite::Result<StorageRecord> {
        let id: i64 = row.get(0)?;
        let interval: i64 = row.get(8)?;
        let max_attempts: i64 = row.get(9)?;
        Ok(StorageRecord {
            id: id as u64,
            mount_path: row.get(1)?,
            driver: row.get(2)?,
            addition: row.get(3)?,
            order: row.get(4)?,
            remark: row.get(5)?,
            disabled: row.get(6)?,
            auto_reconnect: AutoReconnect {
                enabled: row.get(7)?,
                initial_interval_secs: interval.max(0) as u64,
                max_attempts: max_attempts.max(0) as u32,
            },
            status: row.get(10)?,
            modified: row.get(11)?,
        })
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<(SyncJob, String)> {
        let mode: String = row.get(4)?;
        Ok((
            SyncJob {
                id: row.get(0)?,
                task_name: row.get(1)?,
                src_path: row.get(2)?,
                dst_path: row.get(3)?,
                mode: SyncMode::default(),
                lazy_cache: row.get(5)?,
            },
            mode,
        ))
    }

    fn finish_job((mut job, mode): (SyncJob, String)) -> StoreResult<SyncJob> {
        job.mode = mode
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("sync job {}: mode {:?}", job.id, mode)))?;
        Ok(job)
    }

    fn map_unique(err: rusqlite::Error, what: &str) -> StoreError {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(what.to_string())
            }
            other => StoreError::Sqlite(other),
        }
    }
}

impl MountStore for SqliteStore {
    fn create_storage(&self, r: &StorageRecord) -> StoreResult<u64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO storages (mount_path, driver, addition, sort_order, remark, disabled,
                 reconnect_enabled, reconnect_interval, reconnect_max_attempts, status, modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                r.mount_path,
                r.driver,
                r.addition,
                r.order,
                r.remark,
                r.disabled,
                r.auto_reconnect.enabled,
                r.auto_reconnect.initial_interval_secs as i64,
                r.auto_reconnect.max_attempts as i64,
                r.status,
                r.modified,
            ],
        )
        .map_err(|e| Self::map_unique(e, &format!("mount path {} already used", r.mount_path)))?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn update_storage(&self, r: &StorageRecord) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE storages SET mount_path = ?2, driver = ?3, addition = ?4, sort_order = ?5,
                     remark = ?6, disabled = ?7, reconnect_enabled = ?8, reconnect_interval = ?9,
                     reconnect_max_attempts = ?10, status = ?11, modified = ?12
                 WHERE id = ?1",
                params![
                    r.id as i64,
                    r.mount_path,
                    r.driver,
                    r.addition,
                    r.order,
                    r.remark,
                    r.disabled,
                    r.auto_reconnect.enabled,
                    r.auto_reconnect.initial_interval_secs as i64,
                    r.auto_reconnect.max_attempts as i64,
                    r.status,
                    r.modified,
                ],
            )
            .map_err(|e| Self::map_unique(e, &format!("mount path {} already used", r.mount_path)))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("storage {}", r.id)));
        }
        Ok(())
    }

    fn get_storage(&self, id: u64) -> StoreResult<Option<StorageRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM storages WHERE id = ?1", STORAGE_COLUMNS),
                params![id as i64],
                Self::row_to_storage,
            )
            .optional()?;
        Ok(record)
    }

    fn delete_storage(&self, id: u64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM storages WHERE id = ?1", params![id as i64])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("storage {}", id)));
        }
        Ok(())
    }

    fn list_storages(&self) -> StoreResult<Vec<StorageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM storages ORDER BY sort_order, id",
            STORAGE_COLUMNS
        ))?;
        let records = stmt
            .query_map([], Self::row_to_storage)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

impl SyncJobStore for SqliteStore {
    fn create_sync_job(&self, job: &SyncJob) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_jobs (id, task_name, src_path, dst_path, mode, lazy_cache)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.task_name,
                job.src_path,
                job.dst_path,
                job.mode.to_string(),
                job.lazy_cache,
            ],
        )
        .map_err(|e| Self::map_unique(e, &format!("sync job {} exists", job.id)))?;
        Ok(())
    }

    fn update_sync_job(&self, job: &SyncJob) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sync_jobs SET task_name = ?2, src_path = ?3, dst_path = ?4, mode = ?5,
                 lazy_cache = ?6
             WHERE id = ?1",
            params![
                job.id,
                job.task_name,
                job.src_path,
                job.dst_path,
                job.mode.to_string(),
                job.lazy_cache,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("sync job {}", job.id)));
        }
        Ok(())
    }

    fn delete_sync_job(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM sync_jobs WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("sync job {}", id)));
        }
        Ok(())
    }

    fn get_sync_job(&self, id: &str) -> StoreResult<Option<SyncJob>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, task_name, src_path, dst_path, mode, lazy_cache
                 FROM sync_jobs WHERE id = ?1",
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        row.map(Self::finish_job).transpose()
    }

    fn list_sync_jobs(&self, page: usize, per_page: usize) -> StoreResult<(Vec<SyncJob>, usize)> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM sync_jobs", [], |row| row.get(0))?;
        let offset = page.saturating_sub(1) * per_page;
        let mut stmt = conn.prepare(
            "SELECT id, task_name, src_path, dst_path, mode, lazy_cache
             FROM sync_jobs ORDER BY task_name, id LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![per_page as i64, offset as i64], Self::row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(Self::finish_job(row?)?);
        }
        Ok((jobs, total as usize))
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    storages: BTreeMap<u64, StorageRecord>,
    jobs: BTreeMap<String, SyncJob>,
}

/// In-memory store with the same contract as [`SqliteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountStore for MemoryStore {
    fn create_storage(&self, record: &StorageRecord) -> StoreResult<u64> {
        let mut state = self.state.lock();
        if state.storages.values().any(|r| r.mount_path == record.mount_path) {
            return Err(StoreError::Conflict(format!(
                "mount path {} already used",
                record.mount_path
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        let mut stored = record.clone();
        stored.id = id;
        state.storages.insert(id, stored);
        Ok(id)
    }

    fn update_storage(&self, record: &StorageRecord) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state
            .storages
            .values()
            .any(|r| r.mount_path == record.mount_path && r.id != record.id)
        {
            return Err(StoreError::Conflict(format!(
                "mount path {} already used",
                record.mount_path
            )));
        }
        match state.storages.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("storage {}", record.id))),
        }
    }

    fn get_storage(&self, id: u64) -> StoreResult<Option<StorageRecord>> {
        Ok(self.state.lock().storages.get(&id).cloned())
    }

    fn delete_storage(&self, id: u64) -> StoreResult<()> {
        self.state
            .lock()
            .storages
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("storage {}", id)))
    }

    fn list_storages(&self) -> StoreResult<Vec<StorageRecord>> {
        let mut all: Vec<_> = self.state.lock().storages.values().cloned().collect();
        all.sort_by_key(|r| (r.order, r.id));
        Ok(all)
    }
}

impl SyncJobStore for MemoryStore {
    fn create_sync_job(&self, job: &SyncJob) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("sync job {} exists", job.id)));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update_sync_job(&self, job: &SyncJob) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("sync job {}", job.id))),
        }
    }

    fn delete_sync_job(&self, id: &str) -> StoreResult<()> {
        self.state
            .lock()
            .jobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("sync job {}", id)))
    }

    fn get_sync_job(&self, id: &str) -> StoreResult<Option<SyncJob>> {
        Ok(self.state.lock().jobs.get(id).cloned())
    }

    fn list_sync_jobs(&self, page: usize, per_page: usize) -> StoreResult<(Vec<SyncJob>, usize)> {
        let state = self.state.lock();
        let mut all: Vec<_> = state.jobs.values().cloned().collect();
        all.sort_by(|a, b| a.task_name.cmp(&b.task_name).then_with(|| a.id.cmp(&b.id)));
        let total = all.len();
        let offset = page.saturating_sub(1) * per_page;
        let jobs = all.into_iter().skip(offset).take(per_page).collect();
        Ok((jobs, total))
    }
}
