//! Task lifecycle engine.
//!
//! Every long-running operation (copy, move, upload, sync) is a [`Task`]:
//! a three-phase contract the engine sequences as
//!
//! ```text
//!   pending ──▶ running ──▶ before_run ──▶ run_core ──▶ after_run ──▶ succeeded
//!      │                        │                           │
//!      │                        └──▶ errored                ├──▶ failed
//!      │                                                    ├──▶ canceled
//!      └──▶ canceled (cancelled before start)               └──▶ retry (running)
//! ```
//!
//! Cancellation is cooperative: tasks check their token between units of
//! work. [`TaskManager`] owns tasks and runs them on a bounded worker pool.

mod manager;
mod state;

pub use manager::TaskManager;
pub use state::{TaskCore, TaskInfo, TaskState};

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::vfs::{VfsError, VfsResult};

/// A unit of work driven by the [`TaskManager`].
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn core(&self) -> &TaskCore;

    /// Human-readable name.
    fn name(&self) -> String;

    /// Runs before every attempt. An error ends the task as `errored`.
    async fn before_run(&self) -> VfsResult<()> {
        Ok(())
    }

    /// The actual work.
    async fn run_core(&self) -> VfsResult<()>;

    /// Runs after every attempt with the core's result. `last_attempt` is
    /// true when no automatic retry will follow a failure.
    async fn after_run(&self, result: VfsResult<()>, _last_attempt: bool) -> VfsResult<()> {
        result
    }

    /// Runs exactly once each time the task reaches a terminal state.
    async fn on_finished(&self, _state: TaskState) {}

    /// Runs when a terminal task is manually retried, before it is requeued.
    async fn on_retry(&self) {}

    /// Request cancellation.
    fn cancel(&self) {
        self.core().cancel();
    }

    fn info(&self) -> TaskInfo {
        self.core().info(self.name())
    }
}

/// Drive `task` from `running` to a terminal state, retrying failed attempts
/// up to the task's `max_retry`.
///
/// The caller has already moved the task out of `pending`.
pub(crate) async fn run_task(task: Arc<dyn Task>) -> TaskState {
    let core = task.core();
    core.mark_started();

    let state = loop {
        if core.is_cancelled() {
            break TaskState::Canceled;
        }

        if let Err(e) = guarded(task.before_run()).await {
            tracing::warn!(task_id = %core.id(), error = %e, "task before_run failed");
            core.set_error(&e);
            break TaskState::Errored;
        }

        let result = guarded(task.run_core()).await;
        let canceled = core.is_cancelled() || matches!(&result, Err(e) if e.is_canceled());
        let last = result.is_ok() || canceled || core.retry_count() >= core.max_retry();

        match task.after_run(result, last).await {
            Ok(()) if core.is_cancelled() => break TaskState::Canceled,
            Ok(()) => break TaskState::Succeeded,
            Err(_) if canceled || core.is_cancelled() => break TaskState::Canceled,
            Err(e) if e.is_canceled() => break TaskState::Canceled,
            Err(e) if !last => {
                let retry = core.bump_retry();
                tracing::warn!(
                    task_id = %core.id(),
                    retry,
                    max_retry = core.max_retry(),
                    error = %e,
                    "task attempt failed, retrying"
                );
                core.set_error(&e);
            }
            Err(e) => {
                tracing::warn!(task_id = %core.id(), error = %e, "task failed");
                core.set_error(&e);
                break TaskState::Failed;
            }
        }
    };

    finish(task.as_ref(), state).await;
    state
}

/// Record a terminal state and fire `on_finished`.
pub(crate) async fn finish(task: &dyn Task, state: TaskState) {
    let core = task.core();
    core.mark_ended();
    if state == TaskState::Succeeded {
        core.set_progress(100.0);
    }
    core.set_state(state);
    tracing::debug!(task_id = %core.id(), name = %task.name(), state = %state, "task finished");
    task.on_finished(state).await;
}

/// Turn a panic inside a task phase into an error.
async fn guarded<F>(fut: F) -> VfsResult<()>
where
    F: std::future::Future<Output = VfsResult<()>> + Send,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(VfsError::other(format!("[panic] {}", msg)))
        }
    }
}
