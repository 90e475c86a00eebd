//! Task state and the shared bookkeeping every task carries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a task.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// `before_run` failed; the core never ran.
    Errored,
}

impl TaskState {
    /// True once the task will not run again without a manual retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled | TaskState::Errored
        )
    }
}

/// Serializable snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    pub creator: String,
    pub state: TaskState,
    pub status: String,
    pub progress: f64,
    pub total_bytes: u64,
    pub retry: u32,
    pub max_retry: u32,
    pub error: Option<String>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct Times {
    start: Option<SystemTime>,
    end: Option<SystemTime>,
}

/// State shared by every task implementation.
///
/// State changes go through a `watch` channel so observers can await a
/// terminal state instead of polling.
#[derive(Debug)]
pub struct TaskCore {
    id: String,
    creator: String,
    state: watch::Sender<TaskState>,
    progress: Mutex<f64>,
    total_bytes: AtomicU64,
    retry: AtomicU32,
    max_retry: AtomicU32,
    max_retry_set: AtomicBool,
    times: Mutex<Times>,
    status: Mutex<String>,
    error: Mutex<Option<String>>,
    cancel: Mutex<CancellationToken>,
}

impl TaskCore {
    /// Core with a fresh UUID v4 id.
    pub fn new(creator: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), creator)
    }

    pub fn with_id(id: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            creator: creator.into(),
            state: watch::Sender::new(TaskState::Pending),
            progress: Mutex::new(0.0),
            total_bytes: AtomicU64::new(0),
            retry: AtomicU32::new(0),
            max_retry: AtomicU32::new(0),
            max_retry_set: AtomicBool::new(false),
            times: Mutex::new(Times::default()),
            status: Mutex::new(String::new()),
            error: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    /// Move from `from` to `to`. Returns false (and changes nothing) if the
    /// task is not in `from`.
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.send_replace(state);
    }

    /// Wait until the task reaches a terminal state and return it.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            // Sender lives in self, so this is unreachable while we hold &self.
            Err(_) => self.state(),
        }
    }

    // ========================================================================
    // Progress and status
    // ========================================================================

    pub fn progress(&self) -> f64 {
        *self.progress.lock()
    }

    pub fn set_progress(&self, progress: f64) {
        *self.progress.lock() = progress.clamp(0.0, 100.0);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn set_total_bytes(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, error: impl ToString) {
        *self.error.lock() = Some(error.to_string());
    }

    // ========================================================================
    // Retry and timing
    // ========================================================================

    pub fn retry_count(&self) -> u32 {
        self.retry.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_retry(&self) -> u32 {
        self.retry.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry.load(Ordering::SeqCst)
    }

    /// Pin the retry budget; a manager default no longer applies, even for 0.
    pub fn set_max_retry(&self, max_retry: u32) {
        self.max_retry.store(max_retry, Ordering::SeqCst);
        self.max_retry_set.store(true, Ordering::SeqCst);
    }

    /// Apply `max_retry` unless the task set its own.
    pub(crate) fn default_max_retry(&self, max_retry: u32) {
        if !self.max_retry_set.load(Ordering::SeqCst) {
            self.max_retry.store(max_retry, Ordering::SeqCst);
        }
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        self.times.lock().start
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.times.lock().end
    }

    pub(crate) fn mark_started(&self) {
        let mut times = self.times.lock();
        times.start.get_or_insert_with(SystemTime::now);
        times.end = None;
    }

    pub(crate) fn mark_ended(&self) {
        self.times.lock().end = Some(SystemTime::now());
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Current cancellation token. Replaced on manual retry.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Reset a terminal task for a manual retry.
    pub(crate) fn reset(&self) {
        self.retry.store(0, Ordering::SeqCst);
        *self.progress.lock() = 0.0;
        *self.error.lock() = None;
        *self.cancel.lock() = CancellationToken::new();
        *self.times.lock() = Times::default();
        self.set_state(TaskState::Pending);
    }

    pub fn info(&self, name: String) -> TaskInfo {
        let times = self.times.lock();
        TaskInfo {
            id: self.id.clone(),
            name,
            creator: self.creator.clone(),
            state: self.state(),
            status: self.status(),
            progress: self.progress(),
            total_bytes: self.total_bytes(),
            retry: self.retry_count(),
            max_retry: self.max_retry(),
            error: self.error(),
            start_time: times.start,
            end_time: times.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings() {
        assert_eq!(TaskState::Succeeded.to_string(), "succeeded");
        assert_eq!("canceled".parse::<TaskState>().unwrap(), TaskState::Canceled);
        assert!(TaskState::Errored.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_transition_is_conditional() {
        let core = TaskCore::new("test");
        assert!(core.transition(TaskState::Pending, TaskState::Running));
        assert!(!core.transition(TaskState::Pending, TaskState::Canceled));
        assert_eq!(core.state(), TaskState::Running);
    }

    #[test]
    fn test_reset_clears_attempt_state() {
        let core = TaskCore::new("test");
        core.set_state(TaskState::Failed);
        core.bump_retry();
        core.set_progress(40.0);
        core.set_error("boom");
        core.cancel();

        core.reset();
        assert_eq!(core.state(), TaskState::Pending);
        assert_eq!(core.retry_count(), 0);
        assert_eq!(core.progress(), 0.0);
        assert!(core.error().is_none());
        assert!(!core.is_cancelled());
    }

    #[test]
    fn test_info_serializes() {
        let core = TaskCore::with_id("job-1", "sync");
        core.set_progress(150.0);
        let info = core.info("nightly".into());
        assert_eq!(info.progress, 100.0);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["id"], "job-1");
    }
}
