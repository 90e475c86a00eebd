use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{TransferPayload, Transfers};
use crate::lazy::PendingWrite;
use crate::task::{Task, TaskCore, TaskState};
use crate::vfs::{FileStream, VfsResult};

/// Uploads one rewindable stream into a directory.
///
/// Holds one refresh registration under its destination directory from the
/// moment it is queued (and again on each manual retry) until it reaches a
/// terminal state.
pub struct UploadTask {
    core: TaskCore,
    transfers: Arc<Transfers>,
    dst_dir: String,
    file_name: String,
    stream: Mutex<FileStream>,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("id", &self.core.id())
            .field("dst_dir", &self.dst_dir)
            .field("file_name", &self.file_name)
            .finish()
    }
}

impl UploadTask {
    pub(super) fn new(transfers: Arc<Transfers>, dst_dir: String, stream: FileStream) -> Self {
        let core = TaskCore::new("upload");
        core.set_total_bytes(stream.size());
        Self {
            core,
            transfers,
            dst_dir,
            file_name: stream.name().to_string(),
            stream: Mutex::new(stream),
        }
    }

    pub fn dst_dir(&self) -> &str {
        &self.dst_dir
    }

    pub(super) fn register(&self) {
        self.transfers.batch().add_task(
            &self.dst_dir,
            Some(TransferPayload::Refresh {
                path: self.dst_dir.clone(),
            }),
        );
    }
}

#[async_trait]
impl Task for UploadTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn name(&self) -> String {
        format!("upload {} to [{}]", self.file_name, self.dst_dir)
    }

    async fn run_core(&self) -> VfsResult<()> {
        let mut stream = self.stream.lock().await;
        stream.rewind().await?;
        stream.set_cancel(self.core.cancel_token());

        let (mount, actual) = self.transfers.fs().registry().resolve(&self.dst_dir)?;
        let _pending = PendingWrite::new(self.transfers.lazy(), self.dst_dir.clone());
        let progress = |p: f64| self.core.set_progress(p);
        self.transfers
            .fs()
            .put_resolved(&mount, &actual, &mut stream, &progress)
            .await
    }

    async fn on_finished(&self, state: TaskState) {
        tracing::debug!(task_id = %self.core.id(), state = %state, dst = %self.dst_dir, "upload finished");
        self.transfers.batch().mark_finish(&self.dst_dir).await;
    }

    async fn on_retry(&self) {
        self.register();
    }
}
