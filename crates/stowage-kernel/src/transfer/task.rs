use async_trait::async_trait;
use std::sync::Arc;

use super::{TransferKind, TransferPayload, Transfers};
use crate::lazy::PendingWrite;
use crate::task::{Task, TaskCore, TaskState};
use crate::vfs::{VfsError, VfsResult, path};

/// Streams one object (or fans out one directory) between storages.
pub struct TransferTask {
    core: TaskCore,
    transfers: Arc<Transfers>,
    kind: TransferKind,
    src_path: String,
    dst_dir: String,
    group: String,
    name: String,
}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.core.id())
            .field("name", &self.name)
            .field("group", &self.group)
            .finish()
    }
}

impl TransferTask {
    pub(super) fn new(
        transfers: Arc<Transfers>,
        kind: TransferKind,
        src_path: String,
        dst_dir: String,
        group: String,
    ) -> VfsResult<Self> {
        let registry = transfers.fs().registry();
        let (src_mount, src_actual) = registry.resolve(&src_path)?;
        let (dst_mount, dst_actual) = registry.resolve(&dst_dir)?;
        let name = format!(
            "{} [{}]({}) to [{}]({})",
            kind,
            src_mount.mount_path(),
            src_actual,
            dst_mount.mount_path(),
            dst_actual
        );
        Ok(Self {
            core: TaskCore::new(kind.to_string()),
            transfers,
            kind,
            src_path,
            dst_dir,
            group,
            name,
        })
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn src_path(&self) -> &str {
        &self.src_path
    }

    pub fn dst_dir(&self) -> &str {
        &self.dst_dir
    }

    /// Batch key shared with sibling tasks.
    pub fn group(&self) -> &str {
        &self.group
    }
}

#[async_trait]
impl Task for TransferTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run_core(&self) -> VfsResult<()> {
        let fs = self.transfers.fs();
        let obj = fs.get(&self.src_path).await?;

        if obj.is_dir() {
            let dst = path::join(&self.dst_dir, &obj.name);
            fs.make_dir(&dst).await?;
            if self.core.is_cancelled() {
                return Err(VfsError::Canceled);
            }
            let children = self
                .transfers
                .fan_out(self.kind, &self.src_path, &dst, &self.group)
                .await?;
            if self.core.is_cancelled() {
                let manager = self.transfers.task_manager();
                for id in &children {
                    let _ = manager.cancel(id).await;
                }
                return Err(VfsError::Canceled);
            }
            self.core
                .set_status(format!("queued {} children", children.len()));
            return Ok(());
        }

        self.core.set_total_bytes(obj.size);
        self.core.set_status("getting source");
        let (dst_mount, dst_actual) = fs.registry().resolve(&self.dst_dir)?;
        let mut stream = fs.open(&self.src_path).await?;
        stream.set_cancel(self.core.cancel_token());
        if !stream.is_seekable() {
            stream.cache_in_temp_file().await?;
        }

        self.core.set_status("transferring");
        let _pending = PendingWrite::new(self.transfers.lazy(), self.group.clone());
        let progress = |p: f64| self.core.set_progress(p);
        fs.put_resolved(&dst_mount, &dst_actual, &mut stream, &progress)
            .await?;
        self.core.set_status("done");
        Ok(())
    }

    async fn on_finished(&self, state: TaskState) {
        tracing::debug!(task_id = %self.core.id(), state = %state, group = %self.group, "transfer finished");
        self.transfers.batch().mark_finish(&self.group).await;
    }

    async fn on_retry(&self) {
        let payload = match self.kind {
            TransferKind::Copy => None,
            TransferKind::Move => Some(TransferPayload::MoveSource {
                src_path: self.src_path.clone(),
                dst_dir: self.dst_dir.clone(),
            }),
        };
        self.transfers.batch().add_task(&self.group, payload);
    }
}
