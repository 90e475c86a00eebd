use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{ChildKind, ChildTaskInfo, SyncMode, SyncPhase};
use crate::config::SyncConfig;
use crate::task::{Task, TaskCore, TaskState};
use crate::transfer::{TransferKind, TransferOutcome, Transfers};
use crate::vfs::{ObjectInfo, VfsError, VfsResult, path};

/// Relative path and descriptor of one walked entry.
pub type SyncEntry = (String, ObjectInfo);

struct Child {
    info: ChildTaskInfo,
    task: Option<Arc<dyn Task>>,
}

/// Entries of `a` whose relative path is absent from `b`, directories first
/// (ties keep discovery order).
pub fn diff(a: &IndexMap<String, ObjectInfo>, b: &IndexMap<String, ObjectInfo>) -> Vec<SyncEntry> {
    let mut out: Vec<SyncEntry> = a
        .iter()
        .filter(|(rel, _)| !b.contains_key(*rel))
        .map(|(rel, obj)| (rel.clone(), obj.clone()))
        .collect();
    out.sort_by_key(|(_, obj)| !obj.is_dir());
    out
}

/// Walks two trees, applies their difference according to a [`SyncMode`]
/// and waits for the transfer tasks it queued.
pub struct SyncTask {
    core: TaskCore,
    transfers: Arc<Transfers>,
    config: SyncConfig,
    task_name: String,
    src_path: String,
    dst_path: String,
    mode: SyncMode,
    lazy_cache: bool,
    phase: Mutex<SyncPhase>,
    only_src: Mutex<Vec<SyncEntry>>,
    only_dst: Mutex<Vec<SyncEntry>>,
    children: Mutex<Vec<Child>>,
}

impl std::fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTask")
            .field("id", &self.core.id())
            .field("name", &self.task_name)
            .field("mode", &self.mode)
            .field("phase", &*self.phase.lock())
            .finish()
    }
}

impl SyncTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Option<String>,
        transfers: Arc<Transfers>,
        config: SyncConfig,
        task_name: impl Into<String>,
        src_path: &str,
        dst_path: &str,
        mode: SyncMode,
        lazy_cache: bool,
    ) -> Self {
        let core = match id {
            Some(id) => TaskCore::with_id(id, "sync"),
            None => TaskCore::new("sync"),
        };
        Self {
            core,
            transfers,
            config,
            task_name: task_name.into(),
            src_path: path::fix_and_clean(src_path),
            dst_path: path::fix_and_clean(dst_path),
            mode,
            lazy_cache,
            phase: Mutex::new(SyncPhase::Pending),
            only_src: Mutex::new(Vec::new()),
            only_dst: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    /// Entries present only in the source, from the last diff.
    pub fn only_in_src(&self) -> Vec<SyncEntry> {
        self.only_src.lock().clone()
    }

    /// Entries present only in the destination, from the last diff.
    pub fn only_in_dst(&self) -> Vec<SyncEntry> {
        self.only_dst.lock().clone()
    }

    /// Progress snapshots of every child, refreshed on each poll.
    pub fn children(&self) -> Vec<ChildTaskInfo> {
        self.children.lock().iter().map(|c| c.info.clone()).collect()
    }

    fn set_phase(&self, phase: SyncPhase) {
        tracing::debug!(task_id = %self.core.id(), phase = %phase, "sync phase");
        *self.phase.lock() = phase;
        self.core.set_status(phase.to_string());
    }

    fn check_cancel(&self) -> VfsResult<()> {
        if self.core.is_cancelled() {
            Err(VfsError::Canceled)
        } else {
            Ok(())
        }
    }

    fn cancel_children(&self) {
        for child in self.children.lock().iter() {
            if let Some(task) = &child.task {
                if !task.core().state().is_terminal() {
                    task.cancel();
                }
            }
        }
    }

    fn record(&self, info: ChildTaskInfo, task: Option<Arc<dyn Task>>) {
        self.children.lock().push(Child { info, task });
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Recreate `entries` (relative to `from_root`) under `to_root`:
    /// directories directly, files through transfer tasks.
    async fn apply_transfers(
        &self,
        kind: TransferKind,
        entries: &[SyncEntry],
        from_root: &str,
        to_root: &str,
    ) -> VfsResult<()> {
        let fs = self.transfers.fs();
        let child_kind = match kind {
            TransferKind::Copy => ChildKind::Copy,
            TransferKind::Move => ChildKind::Move,
        };

        for (rel, obj) in entries {
            self.check_cancel()?;
            let src = path::join(from_root, rel);
            let dst = path::join(to_root, rel);

            if obj.is_dir() {
                let result = fs.make_dir(&dst).await;
                self.record(ChildTaskInfo::direct(child_kind, &src, &dst, "", result), None);
                continue;
            }

            let dst_parent = path::parent(&dst);
            match self.transfers.transfer(kind, &src, &dst_parent).await {
                Ok(TransferOutcome::Done) => {
                    self.record(ChildTaskInfo::direct(child_kind, &src, &dst, "", Ok(())), None);
                }
                Ok(TransferOutcome::Queued(ids)) => {
                    for id in ids {
                        let task = self.transfers.task_manager().get(&id);
                        let mut info = ChildTaskInfo::direct(child_kind, &src, &dst, "", Ok(()));
                        info.task_id = Some(id);
                        info.state = TaskState::Pending;
                        info.progress = 0.0;
                        self.record(info, task);
                    }
                }
                Err(e) => {
                    tracing::warn!(src = %src, dst = %dst_parent, error = %e, "sync transfer failed");
                    self.record(ChildTaskInfo::direct(child_kind, &src, &dst, "", Err(e)), None);
                }
            }
        }
        Ok(())
    }

    /// Remove `entries` (relative to `root`), skipping anything beneath a
    /// directory already removed in this pass.
    async fn apply_deletes(&self, entries: &[SyncEntry], root: &str) -> VfsResult<()> {
        let mut removed_dirs: Vec<String> = Vec::new();
        for (rel, obj) in entries {
            self.check_cancel()?;
            if removed_dirs
                .iter()
                .any(|dir| rel.starts_with(&format!("{}/", dir)))
            {
                continue;
            }
            let target = path::join(root, rel);
            let result = self.transfers.fs().remove(&target).await;
            if let Err(e) = &result {
                tracing::warn!(path = %target, error = %e, "sync delete failed");
            } else if obj.is_dir() {
                removed_dirs.push(rel.clone());
            }
            self.record(
                ChildTaskInfo::direct(ChildKind::Delete, "", "", &target, result),
                None,
            );
        }
        Ok(())
    }

    // ========================================================================
    // Wait
    // ========================================================================

    /// Refresh child snapshots. Returns (finished, failed, total).
    fn poll_children(&self) -> (usize, usize, usize) {
        let mut children = self.children.lock();
        let mut finished = 0;
        let mut failed = 0;
        for child in children.iter_mut() {
            if let Some(task) = &child.task {
                child.info.state = task.core().state();
                child.info.progress = task.core().progress();
                child.info.error = task.core().error();
            }
            if child.info.state.is_terminal() {
                finished += 1;
                if child.info.state != TaskState::Succeeded {
                    failed += 1;
                }
            }
        }
        (finished, failed, children.len())
    }

    /// Poll children with a growing interval until all are terminal.
    async fn wait_children(&self) -> VfsResult<()> {
        let token = self.core.cancel_token();
        let mut interval = self.config.poll_initial;
        loop {
            let (finished, failed, total) = self.poll_children();
            let progress = if total == 0 {
                100.0
            } else {
                finished as f64 / total as f64 * 100.0
            };
            self.core.set_progress(progress);

            if finished == total {
                if failed > 0 {
                    return Err(VfsError::other(format!(
                        "{} of {} sync items failed",
                        failed, total
                    )));
                }
                return Ok(());
            }

            tokio::select! {
                _ = token.cancelled() => {
                    self.cancel_children();
                    return Err(VfsError::Canceled);
                }
                _ = tokio::time::sleep(interval) => {}
            }
            interval = (interval + self.config.poll_step).min(self.config.poll_max);
        }
    }
}

#[async_trait]
impl Task for SyncTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn name(&self) -> String {
        format!(
            "{} sync [{}] to [{}] with {} mode",
            self.task_name, self.src_path, self.dst_path, self.mode
        )
    }

    async fn run_core(&self) -> VfsResult<()> {
        self.children.lock().clear();
        let result = self.run_phases().await;
        self.set_phase(if result.is_ok() {
            SyncPhase::Done
        } else {
            SyncPhase::Failed
        });
        if result.is_err() {
            self.cancel_children();
        }
        result
    }

    fn cancel(&self) {
        self.core.cancel();
        self.cancel_children();
    }
}

impl SyncTask {
    async fn run_phases(&self) -> VfsResult<()> {
        let fs = self.transfers.fs();
        let refresh = !self.lazy_cache;
        let depth = self.config.max_depth;

        self.set_phase(SyncPhase::WalkingSource);
        let src = fs.walk(&self.src_path, depth, refresh).await?;
        self.check_cancel()?;

        self.set_phase(SyncPhase::WalkingDestination);
        let dst = fs.walk(&self.dst_path, depth, refresh).await?;
        self.check_cancel()?;

        self.set_phase(SyncPhase::Diffing);
        let only_src = diff(&src, &dst);
        let only_dst = diff(&dst, &src);
        tracing::info!(
            task_id = %self.core.id(),
            only_src = only_src.len(),
            only_dst = only_dst.len(),
            mode = %self.mode,
            "sync diff computed"
        );
        *self.only_src.lock() = only_src.clone();
        *self.only_dst.lock() = only_dst.clone();

        self.set_phase(SyncPhase::ApplyingSrcDiff);
        if let Some(kind) = self.mode.src_transfer() {
            self.apply_transfers(kind, &only_src, &self.src_path, &self.dst_path)
                .await?;
        }

        self.set_phase(SyncPhase::ApplyingDstDiff);
        if self.mode.deletes_dst() {
            self.apply_deletes(&only_dst, &self.dst_path).await?;
        }
        if self.mode.copies_back() {
            self.apply_transfers(TransferKind::Copy, &only_dst, &self.dst_path, &self.src_path)
                .await?;
        }

        self.set_phase(SyncPhase::WaitingChildren);
        self.wait_children().await
    }
}
