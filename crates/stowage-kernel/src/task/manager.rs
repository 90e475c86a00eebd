//! Task manager: an explicit work queue drained by a bounded worker pool.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, mpsc, oneshot};

use super::{Task, TaskInfo, TaskState, finish, run_task};
use crate::vfs::{VfsError, VfsResult};

/// Owns tasks for their lifetime and runs at most `workers` at once.
pub struct TaskManager {
    name: String,
    tasks: DashMap<String, (u64, Arc<dyn Task>)>,
    seq: AtomicU64,
    max_retry: u32,
    workers: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<Arc<dyn Task>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn Task>>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.name)
            .field("tasks", &self.tasks.len())
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}

impl TaskManager {
    pub fn new(name: impl Into<String>, workers: usize, max_retry: u32) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tasks: DashMap::new(),
            seq: AtomicU64::new(0),
            max_retry,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the dispatcher. Tasks added before this wait in the queue.
    pub fn start(&self) -> VfsResult<()> {
        let mut rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| VfsError::other(format!("task manager {} already started", self.name)))?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        let workers = Arc::clone(&self.workers);
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!(manager = %name, "task manager stopped");
                        break;
                    }
                    Some(task) = rx.recv() => {
                        let permit = tokio::select! {
                            _ = &mut shutdown_rx => break,
                            permit = Arc::clone(&workers).acquire_owned() => match permit {
                                Ok(p) => p,
                                Err(_) => break,
                            },
                        };
                        // Cancelled while queued: already finished by `cancel`.
                        if !task.core().transition(TaskState::Pending, TaskState::Running) {
                            continue;
                        }
                        tokio::spawn(async move {
                            let _permit = permit;
                            run_task(task).await;
                        });
                    }
                }
            }
        });

        tracing::info!(manager = %self.name, workers = self.workers.available_permits(), "task manager started");
        Ok(())
    }

    /// Take ownership of `task` and queue it.
    pub fn add(&self, task: Arc<dyn Task>) -> String {
        let id = task.core().id().to_string();
        task.core().default_max_retry(self.max_retry);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(id.clone(), (seq, Arc::clone(&task)));
        tracing::debug!(manager = %self.name, task_id = %id, name = %task.name(), "task queued");
        self.enqueue(task);
        id
    }

    fn enqueue(&self, task: Arc<dyn Task>) {
        if self.queue_tx.send(task).is_err() {
            tracing::warn!(manager = %self.name, "task queue closed");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(id).map(|t| Arc::clone(&t.value().1))
    }

    /// Snapshots of every task, in the order they were added.
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<(u64, Arc<dyn Task>)> = self
            .tasks
            .iter()
            .map(|t| (t.value().0, Arc::clone(&t.value().1)))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, t)| t.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Request cancellation. A task that never started goes straight to
    /// `canceled`.
    pub async fn cancel(&self, id: &str) -> VfsResult<()> {
        let task = self.get(id).ok_or_else(|| VfsError::not_found(format!("task {}", id)))?;
        task.cancel();
        if task.core().transition(TaskState::Pending, TaskState::Canceled) {
            finish(task.as_ref(), TaskState::Canceled).await;
        }
        Ok(())
    }

    /// Re-run a terminal task from a clean slate.
    pub async fn retry(&self, id: &str) -> VfsResult<()> {
        let task = self.get(id).ok_or_else(|| VfsError::not_found(format!("task {}", id)))?;
        let state = task.core().state();
        if !state.is_terminal() {
            return Err(VfsError::other(format!("task {} is still {}", id, state)));
        }
        task.core().reset();
        task.on_retry().await;
        tracing::info!(manager = %self.name, task_id = %id, "task retried");
        self.enqueue(task);
        Ok(())
    }

    /// Drop a task. Running tasks are cancelled first.
    pub async fn remove(&self, id: &str) -> VfsResult<()> {
        let task = self.get(id).ok_or_else(|| VfsError::not_found(format!("task {}", id)))?;
        if !task.core().state().is_terminal() {
            self.cancel(id).await?;
        }
        self.tasks.remove(id);
        Ok(())
    }

    /// Drop every terminal task. Returns how many were removed.
    pub fn clear_done(&self) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, (_, task)| !task.core().state().is_terminal());
        before - self.tasks.len()
    }

    /// Stop dispatching and cancel every unfinished task.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let ids: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for id in ids {
            let _ = self.cancel(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskCore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails the first `failures` attempts, counts every hook call.
    struct Scripted {
        core: TaskCore,
        failures: u32,
        fail_before: bool,
        block_until_cancelled: bool,
        cancel_during_run: bool,
        attempts: AtomicU32,
        last_flags: Mutex<Vec<bool>>,
        finished: Mutex<Vec<TaskState>>,
        retried: AtomicU32,
    }

    impl Scripted {
        fn new(failures: u32) -> Self {
            Self {
                core: TaskCore::new("test"),
                failures,
                fail_before: false,
                block_until_cancelled: false,
                cancel_during_run: false,
                attempts: AtomicU32::new(0),
                last_flags: Mutex::new(Vec::new()),
                finished: Mutex::new(Vec::new()),
                retried: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Task for Scripted {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        fn name(&self) -> String {
            "scripted".into()
        }

        async fn before_run(&self) -> VfsResult<()> {
            if self.fail_before {
                return Err(VfsError::other("no batch"));
            }
            Ok(())
        }

        async fn run_core(&self) -> VfsResult<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.block_until_cancelled {
                self.core.cancel_token().cancelled().await;
                return Err(VfsError::Canceled);
            }
            if self.cancel_during_run {
                self.core.cancel();
            }
            if n <= self.failures {
                return Err(VfsError::other(format!("attempt {} failed", n)));
            }
            Ok(())
        }

        async fn after_run(&self, result: VfsResult<()>, last: bool) -> VfsResult<()> {
            self.last_flags.lock().push(last);
            result
        }

        async fn on_finished(&self, state: TaskState) {
            self.finished.lock().push(state);
        }

        async fn on_retry(&self) {
            self.retried.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(workers: usize, max_retry: u32) -> TaskManager {
        let m = TaskManager::new("test", workers, max_retry);
        m.start().unwrap();
        m
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let m = manager(2, 3);
        let task = Arc::new(Scripted::new(0));
        m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Succeeded);
        assert_eq!(task.core.progress(), 100.0);
        assert_eq!(*task.last_flags.lock(), vec![true]);
        assert_eq!(*task.finished.lock(), vec![TaskState::Succeeded]);
        assert!(task.core.end_time().is_some());
    }

    #[tokio::test]
    async fn test_automatic_retries_then_fail() {
        let m = manager(1, 2);
        let task = Arc::new(Scripted::new(10));
        m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Failed);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*task.last_flags.lock(), vec![false, false, true]);
        assert_eq!(task.core.retry_count(), 2);
        assert_eq!(*task.finished.lock(), vec![TaskState::Failed]);
        assert!(task.core.error().unwrap().contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let m = manager(1, 3);
        let task = Arc::new(Scripted::new(1));
        m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Succeeded);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(task.finished.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_before_run_failure_is_errored() {
        let m = manager(1, 3);
        let mut task = Scripted::new(0);
        task.fail_before = true;
        let task = Arc::new(task);
        m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Errored);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(*task.finished.lock(), vec![TaskState::Errored]);
    }

    #[tokio::test]
    async fn test_cancel_pending_finishes_once() {
        // Not started: the task stays queued.
        let m = TaskManager::new("idle", 1, 0);
        let task = Arc::new(Scripted::new(0));
        let id = m.add(task.clone());
        m.cancel(&id).await.unwrap();
        assert_eq!(task.core.state(), TaskState::Canceled);

        // Starting later must not run it.
        m.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(*task.finished.lock(), vec![TaskState::Canceled]);
    }

    #[tokio::test]
    async fn test_cancel_running() {
        let m = manager(1, 3);
        let mut task = Scripted::new(0);
        task.block_until_cancelled = true;
        let task = Arc::new(task);
        let id = m.add(task.clone());

        let mut rx = task.core.subscribe();
        rx.wait_for(|s| *s == TaskState::Running).await.unwrap();
        m.cancel(&id).await.unwrap();
        assert_eq!(task.core.wait().await, TaskState::Canceled);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*task.finished.lock(), vec![TaskState::Canceled]);
    }

    #[tokio::test]
    async fn test_manual_retry_resets() {
        let m = manager(1, 0);
        let task = Arc::new(Scripted::new(1));
        let id = m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Failed);

        m.retry(&id).await.unwrap();
        assert_eq!(task.retried.load(Ordering::SeqCst), 1);
        assert_eq!(task.core.wait().await, TaskState::Succeeded);
        assert_eq!(
            *task.finished.lock(),
            vec![TaskState::Failed, TaskState::Succeeded]
        );
        assert!(task.core.error().is_none());
    }

    #[tokio::test]
    async fn test_retry_rejects_running() {
        let m = manager(1, 0);
        let mut task = Scripted::new(0);
        task.block_until_cancelled = true;
        let task = Arc::new(task);
        let id = m.add(task.clone());
        let mut rx = task.core.subscribe();
        rx.wait_for(|s| *s == TaskState::Running).await.unwrap();
        assert!(m.retry(&id).await.is_err());
        m.shutdown().await;
        assert_eq!(task.core.wait().await, TaskState::Canceled);
    }

    #[tokio::test]
    async fn test_worker_bound() {
        let m = manager(2, 0);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let mut t = Scripted::new(0);
                t.block_until_cancelled = true;
                Arc::new(t)
            })
            .collect();
        for t in &tasks {
            m.add(t.clone());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let running = tasks
            .iter()
            .filter(|t| t.core.state() == TaskState::Running)
            .count();
        assert_eq!(running, 2);

        m.shutdown().await;
        for t in &tasks {
            assert_eq!(t.core.wait().await, TaskState::Canceled);
        }
    }

    #[tokio::test]
    async fn test_list_and_clear_done() {
        let m = manager(2, 0);
        let done = Arc::new(Scripted::new(0));
        let id = m.add(done.clone());
        done.core.wait().await;

        let infos = m.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, id);
        assert_eq!(infos[0].state, TaskState::Succeeded);

        assert_eq!(m.clear_done(), 1);
        assert!(m.is_empty());
        assert!(m.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_explicit_zero_retries_kept() {
        let m = manager(1, 3);
        let task = Arc::new(Scripted::new(10));
        task.core.set_max_retry(0);
        m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Failed);
        assert_eq!(task.core.max_retry(), 0);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 1);

        let defaulted = Arc::new(Scripted::new(0));
        m.add(defaulted.clone());
        assert_eq!(defaulted.core.max_retry(), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_successful_run_is_canceled() {
        let m = manager(1, 3);
        let mut task = Scripted::new(0);
        task.cancel_during_run = true;
        let task = Arc::new(task);
        m.add(task.clone());
        assert_eq!(task.core.wait().await, TaskState::Canceled);
        assert_eq!(task.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*task.finished.lock(), vec![TaskState::Canceled]);
        assert!(task.core.progress() < 100.0);
    }
}
