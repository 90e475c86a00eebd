//! Background reconnection of failed mounts.
//!
//! One [`ReconnectTask`] exists per mount path whose backend failed to
//! initialize while auto-reconnect was enabled. A single loop ticks at a fixed
//! cadence, promotes due tasks into a bounded attempt queue, and runs each
//! attempt as its own tokio task. Failures reschedule with exponential
//! backoff plus jitter until `max_attempts` is reached.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{VfsError, VfsResult};
use super::ops::StorageDriver;
use crate::config::ReconnectConfig;
use crate::db::StorageRecord;

/// Re-runs a mount's init routine. Implemented by the storage registry.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self, record: &StorageRecord, driver: Arc<dyn StorageDriver>) -> VfsResult<()>;
}

/// Where a task is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Waiting for `next_retry_at`.
    Scheduled,
    /// Queued or running an attempt.
    Attempting,
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The mount works again; the task is gone.
    Reconnected,
    /// Failed; next attempt after the delay.
    Rescheduled(Duration),
    /// Failed for the last allowed time; the task is gone.
    GaveUp(String),
    /// The task was removed or replaced while the attempt ran.
    Cancelled,
}

/// Retry state for one mount path.
struct ReconnectTask {
    record: StorageRecord,
    driver: Arc<dyn StorageDriver>,
    retry_count: u32,
    next_retry_at: Instant,
    phase: ReconnectPhase,
    cancel: CancellationToken,
    generation: u64,
}

/// Snapshot of a task, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectStatus {
    pub mount_path: String,
    pub retry_count: u32,
    pub phase: ReconnectPhase,
    pub next_retry_in: Duration,
}

type QueueItem = (String, u64);

/// Reconnect scheduler.
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    tasks: DashMap<String, ReconnectTask>,
    generation: AtomicU64,
    queue_tx: mpsc::Sender<QueueItem>,
    queue_rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
}

impl std::fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Stops the scheduler loop when dropped or shut down.
pub struct ReconnectHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl ReconnectHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }
}

impl Drop for ReconnectHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            tasks: DashMap::new(),
            generation: AtomicU64::new(0),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    /// Register or replace the task for a mount and make it due immediately.
    pub fn add_or_update(&self, record: StorageRecord, driver: Arc<dyn StorageDriver>) {
        let mount_path = record.mount_path.clone();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let task = ReconnectTask {
            record,
            driver,
            retry_count: 0,
            next_retry_at: Instant::now(),
            phase: ReconnectPhase::Scheduled,
            cancel: CancellationToken::new(),
            generation,
        };
        if let Some(old) = self.tasks.insert(mount_path.clone(), task) {
            old.cancel.cancel();
        }
        tracing::info!(mount_path = %mount_path, "scheduled reconnect");
    }

    /// Cancel and drop the task for a mount, whatever its phase.
    pub fn remove(&self, mount_path: &str) -> bool {
        match self.tasks.remove(mount_path) {
            Some((_, task)) => {
                task.cancel.cancel();
                tracing::info!(mount_path = %mount_path, "removed reconnect task");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, mount_path: &str) -> bool {
        self.tasks.contains_key(mount_path)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn status(&self, mount_path: &str) -> Option<ReconnectStatus> {
        self.tasks.get(mount_path).map(|t| ReconnectStatus {
            mount_path: mount_path.to_string(),
            retry_count: t.retry_count,
            phase: t.phase,
            next_retry_in: t.next_retry_at.saturating_duration_since(Instant::now()),
        })
    }

    /// Backoff for the given (already incremented) retry count.
    fn backoff(&self, initial_secs: u64, retry_count: u32) -> Duration {
        let base = Duration::from_secs(initial_secs).max(self.config.backoff_floor);
        let interval = base.saturating_mul(1u32 << retry_count.min(16));
        let jitter_cap = (interval.as_millis() / 10) as u64;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        interval + Duration::from_millis(jitter)
    }

    /// Move every due `Scheduled` task into the attempt queue. Returns how
    /// many were queued.
    pub fn check_due(&self) -> usize {
        let now = Instant::now();
        let mut queued = 0;
        for mut entry in self.tasks.iter_mut() {
            let (mount_path, task) = entry.pair_mut();
            if task.phase != ReconnectPhase::Scheduled || task.next_retry_at > now {
                continue;
            }
            match self.queue_tx.try_send((mount_path.clone(), task.generation)) {
                Ok(()) => {
                    task.phase = ReconnectPhase::Attempting;
                    queued += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(mount_path = %mount_path, "reconnect queue full, retrying next tick");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("reconnect queue closed");
                    break;
                }
            }
        }
        queued
    }

    /// Run one attempt for `mount_path`.
    ///
    /// `generation` pins the task version the attempt belongs to; `None`
    /// takes whatever is registered now.
    pub async fn attempt(
        &self,
        target: &dyn Reconnect,
        mount_path: &str,
        generation: Option<u64>,
    ) -> AttemptOutcome {
        let (record, driver, cancel, generation) = {
            let Some(mut task) = self.tasks.get_mut(mount_path) else {
                return AttemptOutcome::Cancelled;
            };
            if generation.is_some_and(|g| g != task.generation) {
                return AttemptOutcome::Cancelled;
            }
            task.phase = ReconnectPhase::Attempting;
            (
                task.record.clone(),
                Arc::clone(&task.driver),
                task.cancel.clone(),
                task.generation,
            )
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
            res = target.reconnect(&record, driver) => res,
        };

        let Some(mut task) = self.tasks.get_mut(mount_path) else {
            return AttemptOutcome::Cancelled;
        };
        if task.generation != generation {
            return AttemptOutcome::Cancelled;
        }

        match result {
            Ok(()) => {
                drop(task);
                self.tasks.remove(mount_path);
                tracing::info!(mount_path = %mount_path, "reconnected storage");
                AttemptOutcome::Reconnected
            }
            Err(err) => {
                task.retry_count += 1;
                let max = record.auto_reconnect.max_attempts;
                if max > 0 && task.retry_count >= max {
                    drop(task);
                    self.tasks.remove(mount_path);
                    tracing::warn!(
                        mount_path = %mount_path,
                        attempts = max,
                        error = %err,
                        "max reconnect attempts reached, giving up"
                    );
                    return AttemptOutcome::GaveUp(err.to_string());
                }
                let delay = self.backoff(record.auto_reconnect.initial_interval_secs, task.retry_count);
                task.next_retry_at = Instant::now() + delay;
                task.phase = ReconnectPhase::Scheduled;
                tracing::info!(
                    mount_path = %mount_path,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    attempt = task.retry_count + 1,
                    "reconnect failed, rescheduled"
                );
                AttemptOutcome::Rescheduled(delay)
            }
        }
    }

    /// Start the coordinating loop.
    ///
    /// The loop holds only a weak reference to `target`, so it stops on its
    /// own once the registry is dropped.
    pub fn start(self: &Arc<Self>, target: Weak<dyn Reconnect>) -> VfsResult<ReconnectHandle> {
        let mut rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| VfsError::other("reconnect scheduler already started"))?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let scheduler = Arc::clone(self);
        let tick = self.config.tick;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!("reconnect scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        scheduler.check_due();
                    }
                    Some((mount_path, generation)) = rx.recv() => {
                        let Some(target) = target.upgrade() else {
                            tracing::debug!("registry dropped, reconnect scheduler exiting");
                            break;
                        };
                        let scheduler = Arc::clone(&scheduler);
                        tokio::spawn(async move {
                            scheduler
                                .attempt(target.as_ref(), &mount_path, Some(generation))
                                .await;
                        });
                    }
                }
            }
        });

        tracing::info!(tick_ms = tick.as_millis() as u64, "reconnect scheduler started");
        Ok(ReconnectHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        })
    }
}
