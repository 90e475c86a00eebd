//! Directory synchronization.
//!
//! A [`SyncTask`] walks the source and destination trees to a bounded depth,
//! computes which relative paths exist on only one side, then applies a
//! [`SyncMode`]:
//!
//! | mode              | only in source      | only in destination      |
//! |-------------------|---------------------|--------------------------|
//! | `copy`            | copy to destination | -                        |
//! | `move`            | move to destination | -                        |
//! | `delete`          | -                   | remove                   |
//! | `copy_and_delete` | copy to destination | remove                   |
//! | `move_and_delete` | move to destination | remove                   |
//! | `two_way_sync`    | copy to destination | copy back to source      |
//!
//! Directories are created and entries removed directly; files go through
//! transfer tasks, which the sync task polls until they finish.

mod task;

pub use task::{SyncEntry, SyncTask, diff};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::db::{SyncJob, SyncJobStore};
use crate::task::{Task, TaskManager, TaskState};
use crate::transfer::{TransferKind, Transfers};
use crate::vfs::{VfsError, VfsResult};

/// How a sync reconciles the two trees.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Copy,
    Move,
    Delete,
    CopyAndDelete,
    MoveAndDelete,
    TwoWaySync,
}

impl SyncMode {
    /// How source-only entries reach the destination, if at all.
    pub fn src_transfer(&self) -> Option<TransferKind> {
        match self {
            SyncMode::Copy | SyncMode::CopyAndDelete | SyncMode::TwoWaySync => {
                Some(TransferKind::Copy)
            }
            SyncMode::Move | SyncMode::MoveAndDelete => Some(TransferKind::Move),
            SyncMode::Delete => None,
        }
    }

    /// Destination-only entries are removed.
    pub fn deletes_dst(&self) -> bool {
        matches!(
            self,
            SyncMode::Delete | SyncMode::CopyAndDelete | SyncMode::MoveAndDelete
        )
    }

    /// Destination-only entries are copied back to the source.
    pub fn copies_back(&self) -> bool {
        matches!(self, SyncMode::TwoWaySync)
    }
}

/// Where a sync task is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncPhase {
    Pending,
    WalkingSource,
    WalkingDestination,
    Diffing,
    ApplyingSrcDiff,
    ApplyingDstDiff,
    WaitingChildren,
    Done,
    Failed,
}

/// What a sync child does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChildKind {
    Copy,
    Move,
    Delete,
}

/// Progress snapshot of one sync child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildTaskInfo {
    /// Transfer task id; `None` for work done directly.
    pub task_id: Option<String>,
    pub kind: ChildKind,
    pub src_path: String,
    pub dst_path: String,
    pub delete_path: String,
    pub state: TaskState,
    pub progress: f64,
    pub error: Option<String>,
}

impl ChildTaskInfo {
    /// Snapshot of work finished synchronously.
    pub(crate) fn direct(
        kind: ChildKind,
        src_path: &str,
        dst_path: &str,
        delete_path: &str,
        result: VfsResult<()>,
    ) -> Self {
        let (state, error) = match result {
            Ok(()) => (TaskState::Succeeded, None),
            Err(e) => (TaskState::Failed, Some(e.to_string())),
        };
        Self {
            task_id: None,
            kind,
            src_path: src_path.to_string(),
            dst_path: dst_path.to_string(),
            delete_path: delete_path.to_string(),
            state,
            progress: 100.0,
            error,
        }
    }
}

// ============================================================================
// Sync service
// ============================================================================

/// Stored sync jobs and the sync tasks run from them.
pub struct Syncer {
    store: Arc<dyn SyncJobStore>,
    transfers: Arc<Transfers>,
    tasks: Arc<TaskManager>,
    config: SyncConfig,
    running: DashMap<String, Arc<SyncTask>>,
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("tasks", &self.tasks)
            .field("config", &self.config)
            .finish()
    }
}

impl Syncer {
    pub fn new(
        store: Arc<dyn SyncJobStore>,
        transfers: Arc<Transfers>,
        tasks: Arc<TaskManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transfers,
            tasks,
            config,
            running: DashMap::new(),
        }
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Store a new job. An empty id is replaced by a fresh UUID.
    pub fn create_job(&self, mut job: SyncJob) -> VfsResult<SyncJob> {
        if job.id.is_empty() {
            job.id = uuid::Uuid::new_v4().to_string();
        }
        self.store.create_sync_job(&job)?;
        tracing::info!(job_id = %job.id, name = %job.task_name, mode = %job.mode, "sync job created");
        Ok(job)
    }

    pub fn update_job(&self, job: &SyncJob) -> VfsResult<()> {
        Ok(self.store.update_sync_job(job)?)
    }

    pub fn delete_job(&self, id: &str) -> VfsResult<()> {
        self.store.delete_sync_job(id)?;
        tracing::info!(job_id = %id, "sync job deleted");
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> VfsResult<SyncJob> {
        self.store
            .get_sync_job(id)?
            .ok_or_else(|| VfsError::not_found(format!("sync job {}", id)))
    }

    /// One page of jobs (1-based) and the total count.
    pub fn list_jobs(&self, page: usize, per_page: usize) -> VfsResult<(Vec<SyncJob>, usize)> {
        Ok(self.store.list_sync_jobs(page, per_page)?)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Run a stored job. The task reuses the job id, so a job runs at most
    /// once at a time.
    pub async fn run_job(&self, id: &str) -> VfsResult<String> {
        let job = self.get_job(id)?;
        if let Some(previous) = self.tasks.get(&job.id) {
            let state = previous.core().state();
            if !state.is_terminal() {
                return Err(VfsError::other(format!("sync job {} is already {}", job.id, state)));
            }
            self.tasks.remove(&job.id).await?;
        }
        let task = SyncTask::new(
            Some(job.id.clone()),
            Arc::clone(&self.transfers),
            self.config.clone(),
            job.task_name,
            &job.src_path,
            &job.dst_path,
            job.mode,
            job.lazy_cache,
        );
        Ok(self.submit(task))
    }

    /// Run an ad hoc sync.
    pub fn sync(
        &self,
        task_name: &str,
        src_path: &str,
        dst_path: &str,
        mode: SyncMode,
        lazy_cache: bool,
    ) -> String {
        let task = SyncTask::new(
            None,
            Arc::clone(&self.transfers),
            self.config.clone(),
            task_name,
            src_path,
            dst_path,
            mode,
            lazy_cache,
        );
        self.submit(task)
    }

    fn submit(&self, task: SyncTask) -> String {
        let task = Arc::new(task);
        self.running
            .insert(task.core().id().to_string(), Arc::clone(&task));
        self.tasks.add(task)
    }

    pub fn task(&self, id: &str) -> Option<Arc<SyncTask>> {
        self.running.get(id).map(|t| Arc::clone(t.value()))
    }

    pub async fn cancel(&self, id: &str) -> VfsResult<()> {
        self.tasks.cancel(id).await
    }

    /// Forget finished sync tasks.
    pub fn clear_done(&self) -> usize {
        self.running
            .retain(|_, task| !task.core().state().is_terminal());
        self.tasks.clear_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_strings() {
        assert_eq!(SyncMode::CopyAndDelete.to_string(), "copy_and_delete");
        assert_eq!("two_way_sync".parse::<SyncMode>().unwrap(), SyncMode::TwoWaySync);
        assert!("sideways".parse::<SyncMode>().is_err());
        assert_eq!(
            serde_json::to_string(&SyncMode::MoveAndDelete).unwrap(),
            "\"move_and_delete\""
        );
    }

    #[test]
    fn test_mode_table() {
        use SyncMode::*;
        let table = [
            (Copy, Some(TransferKind::Copy), false, false),
            (Move, Some(TransferKind::Move), false, false),
            (Delete, None, true, false),
            (CopyAndDelete, Some(TransferKind::Copy), true, false),
            (MoveAndDelete, Some(TransferKind::Move), true, false),
            (TwoWaySync, Some(TransferKind::Copy), false, true),
        ];
        for (mode, transfer, deletes, back) in table {
            assert_eq!(mode.src_transfer(), transfer, "{mode}");
            assert_eq!(mode.deletes_dst(), deletes, "{mode}");
            assert_eq!(mode.copies_back(), back, "{mode}");
        }
    }
}
