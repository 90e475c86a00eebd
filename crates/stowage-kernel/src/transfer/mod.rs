//! Copy, move and upload across storages.
//!
//! A transfer between two paths on the same mount first tries the driver's
//! native operation. Otherwise (or when the driver answers "not
//! implemented") the generic path streams objects from the source driver into
//! the destination driver, one [`TransferTask`] per object.
//!
//! A directory transfer creates the destination directory, then queues one
//! task per child. All of them register under one batch key (the destination
//! directory), so the listing refresh and, for moves, the verify-then-remove
//! of the sources run once for the whole subtree.

mod finalize;
mod task;
mod upload;

pub use finalize::FinalizeReport;
pub use task::TransferTask;
pub use upload::UploadTask;

use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::batch::BatchCoordinator;
use crate::config::TransferConfig;
use crate::fs::Fs;
use crate::lazy::{LazyCounter, PendingWrite};
use crate::task::TaskManager;
use crate::vfs::{FileStream, ProgressFn, VfsError, VfsResult, path};

/// Copy or move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferKind {
    Copy,
    Move,
}

/// Work attached to a batch group, consumed by the finish hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPayload {
    /// Refresh the listing of this virtual directory.
    Refresh { path: String },
    /// Remove `src_path` once its copy shows up in `dst_dir`.
    MoveSource { src_path: String, dst_dir: String },
}

/// What a transfer request turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Finished synchronously (native operation).
    Done,
    /// Queued as these tasks.
    Queued(Vec<String>),
}

impl TransferOutcome {
    pub fn task_ids(&self) -> &[String] {
        match self {
            TransferOutcome::Done => &[],
            TransferOutcome::Queued(ids) => ids,
        }
    }
}

/// Transfer service.
pub struct Transfers {
    fs: Arc<Fs>,
    lazy: Arc<LazyCounter>,
    batch: Arc<BatchCoordinator<TransferPayload>>,
    tasks: Arc<TaskManager>,
    uploads: Arc<TaskManager>,
    config: TransferConfig,
    reports: Mutex<IndexMap<String, FinalizeReport>>,
}

impl std::fmt::Debug for Transfers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfers")
            .field("tasks", &self.tasks)
            .field("uploads", &self.uploads)
            .finish()
    }
}

impl Transfers {
    /// Build the service and install its finish hook on `batch`.
    pub fn new(
        fs: Arc<Fs>,
        lazy: Arc<LazyCounter>,
        batch: Arc<BatchCoordinator<TransferPayload>>,
        tasks: Arc<TaskManager>,
        uploads: Arc<TaskManager>,
        config: TransferConfig,
    ) -> Arc<Self> {
        let transfers = Arc::new(Self {
            fs,
            lazy,
            batch,
            tasks,
            uploads,
            config,
            reports: Mutex::new(IndexMap::new()),
        });

        let weak = Arc::downgrade(&transfers);
        transfers.batch.set_finish_hook(Arc::new(move |key, payloads| {
            let weak = weak.clone();
            async move {
                if let Some(transfers) = weak.upgrade() {
                    transfers.finalize(key, payloads).await;
                }
            }
            .boxed()
        }));
        transfers
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn upload_manager(&self) -> &Arc<TaskManager> {
        &self.uploads
    }

    pub fn batch(&self) -> &Arc<BatchCoordinator<TransferPayload>> {
        &self.batch
    }

    pub fn lazy(&self) -> &Arc<LazyCounter> {
        &self.lazy
    }

    // ========================================================================
    // Copy / move
    // ========================================================================

    pub async fn copy(self: &Arc<Self>, src: &str, dst_dir: &str) -> VfsResult<TransferOutcome> {
        self.transfer(TransferKind::Copy, src, dst_dir).await
    }

    pub async fn move_(self: &Arc<Self>, src: &str, dst_dir: &str) -> VfsResult<TransferOutcome> {
        self.transfer(TransferKind::Move, src, dst_dir).await
    }

    /// Copy or move `src` into the directory `dst_dir`.
    pub async fn transfer(
        self: &Arc<Self>,
        kind: TransferKind,
        src: &str,
        dst_dir: &str,
    ) -> VfsResult<TransferOutcome> {
        let src = path::fix_and_clean(src);
        let dst_dir = path::fix_and_clean(dst_dir);
        if path::is_sub_path(&src, &dst_dir) {
            return Err(VfsError::invalid_path(format!(
                "cannot {} {} into itself",
                kind, src
            )));
        }

        let registry = self.fs.registry();
        let (src_mount, _) = registry.resolve(&src)?;
        let (dst_mount, _) = registry.resolve(&dst_dir)?;

        if Arc::ptr_eq(&src_mount, &dst_mount) {
            let native = match kind {
                TransferKind::Copy => self.fs.copy_native(&src, &dst_dir).await,
                TransferKind::Move => self.fs.move_native(&src, &dst_dir).await,
            };
            match native {
                Ok(()) => {
                    tracing::info!(%kind, src = %src, dst = %dst_dir, "native transfer done");
                    return Ok(TransferOutcome::Done);
                }
                Err(e) if e.is_not_implemented() => {
                    tracing::debug!(%kind, src = %src, "native transfer unavailable, streaming");
                }
                Err(e) => return Err(e),
            }
        }

        if dst_mount.config().no_upload {
            return Err(VfsError::UploadNotSupported);
        }

        let obj = self.fs.get(&src).await?;
        if !obj.is_dir() {
            let payload = self.own_payload(kind, &src, &dst_dir);
            let id = self.spawn(kind, src, dst_dir.clone(), dst_dir, payload)?;
            return Ok(TransferOutcome::Queued(vec![id]));
        }

        // Hold the group open while fanning out so an early finisher cannot
        // drain it; the directory's own payload verifies the whole subtree.
        let dst = path::join(&dst_dir, &obj.name);
        self.fs.make_dir(&dst).await?;
        self.batch
            .add_task(&dst, self.own_payload(kind, &src, &dst_dir));
        let ids = self.fan_out(kind, &src, &dst, &dst).await;
        self.batch.mark_finish(&dst).await;
        let ids = ids?;
        tracing::info!(%kind, src = %src, dst = %dst, children = ids.len(), "directory transfer queued");
        Ok(TransferOutcome::Queued(ids))
    }

    /// Queue one child task per entry of `src_dir`, writing into `dst_dir`.
    pub(crate) async fn fan_out(
        self: &Arc<Self>,
        kind: TransferKind,
        src_dir: &str,
        dst_dir: &str,
        group: &str,
    ) -> VfsResult<Vec<String>> {
        let children = self.fs.list(src_dir, false).await?;
        let mut ids = Vec::with_capacity(children.len());
        for child in children {
            let child_src = path::join(src_dir, &child.name);
            ids.push(self.spawn(kind, child_src, dst_dir.to_string(), group.to_string(), None)?);
        }
        Ok(ids)
    }

    fn own_payload(&self, kind: TransferKind, src: &str, dst_dir: &str) -> Option<TransferPayload> {
        match kind {
            TransferKind::Copy => None,
            TransferKind::Move => Some(TransferPayload::MoveSource {
                src_path: src.to_string(),
                dst_dir: dst_dir.to_string(),
            }),
        }
    }

    /// Register a task with its batch, then queue it.
    fn spawn(
        self: &Arc<Self>,
        kind: TransferKind,
        src: String,
        dst_dir: String,
        group: String,
        payload: Option<TransferPayload>,
    ) -> VfsResult<String> {
        let task = TransferTask::new(Arc::clone(self), kind, src, dst_dir, group)?;
        self.batch.add_task(task.group(), payload);
        Ok(self.tasks.add(Arc::new(task)))
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Upload without a task. Returns once the destination driver is done.
    pub async fn put_directly(
        &self,
        dst_dir: &str,
        stream: &mut FileStream,
        progress: &ProgressFn<'_>,
    ) -> VfsResult<()> {
        let dst_dir = path::fix_and_clean(dst_dir);
        let (mount, actual) = self.fs.registry().resolve(&dst_dir)?;
        let _pending = PendingWrite::new(&self.lazy, dst_dir.clone());
        self.fs.put_resolved(&mount, &actual, stream, progress).await
    }

    /// Upload as a task on the upload pool. Forward-only streams are spilled
    /// to a temp file first so retries can rewind.
    pub async fn upload(self: &Arc<Self>, dst_dir: &str, mut stream: FileStream) -> VfsResult<String> {
        let dst_dir = path::fix_and_clean(dst_dir);
        let (mount, _) = self.fs.registry().resolve(&dst_dir)?;
        if mount.config().no_upload {
            return Err(VfsError::UploadNotSupported);
        }
        stream.cache_in_temp_file().await?;
        let task = UploadTask::new(Arc::clone(self), dst_dir, stream);
        task.register();
        Ok(self.uploads.add(Arc::new(task)))
    }
}
