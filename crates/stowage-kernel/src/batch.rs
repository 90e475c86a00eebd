//! Batch completion coordinator.
//!
//! Sibling tasks that write under one destination register under the same
//! key. When the last of them reports completion the group is removed and the
//! finish hook runs once with every payload collected for that key.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Called with the key and its payloads when a group drains.
pub type FinishHook<P> = Arc<dyn Fn(String, Vec<P>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct Group<P> {
    pending: usize,
    payloads: Vec<P>,
}

/// Groups tasks by key and fires a hook once per group epoch.
pub struct BatchCoordinator<P> {
    groups: Mutex<HashMap<String, Group<P>>>,
    hook: Mutex<Option<FinishHook<P>>>,
}

impl<P> std::fmt::Debug for BatchCoordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("groups", &self.groups.lock().len())
            .finish()
    }
}

impl<P: Send + 'static> Default for BatchCoordinator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + 'static> BatchCoordinator<P> {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            hook: Mutex::new(None),
        }
    }

    pub fn set_finish_hook(&self, hook: FinishHook<P>) {
        *self.hook.lock() = Some(hook);
    }

    /// Register one pending task under `key`, optionally with a payload.
    pub fn add_task(&self, key: &str, payload: Option<P>) {
        let mut groups = self.groups.lock();
        let group = groups.entry(key.to_string()).or_insert_with(|| Group {
            pending: 0,
            payloads: Vec::new(),
        });
        group.pending += 1;
        if let Some(p) = payload {
            group.payloads.push(p);
        }
    }

    /// Attach a payload to a live group without changing its count.
    /// Returns false if no group exists for `key`.
    pub fn append_payload(&self, key: &str, payload: P) -> bool {
        match self.groups.lock().get_mut(key) {
            Some(group) => {
                group.payloads.push(payload);
                true
            }
            None => false,
        }
    }

    /// Pending count for `key` (0 if no group).
    pub fn pending(&self, key: &str) -> usize {
        self.groups.lock().get(key).map(|g| g.pending).unwrap_or(0)
    }

    /// Report one task under `key` as finished. When it was the last one the
    /// group is dissolved and the finish hook runs before this returns.
    ///
    /// Returns true if this call fired the hook. Unknown keys are ignored.
    pub async fn mark_finish(&self, key: &str) -> bool {
        let drained = {
            let mut groups = self.groups.lock();
            let Some(group) = groups.get_mut(key) else {
                tracing::debug!(key, "mark_finish for unknown batch");
                return false;
            };
            group.pending = group.pending.saturating_sub(1);
            if group.pending > 0 {
                return false;
            }
            groups.remove(key)
        };
        let Some(group) = drained else {
            return false;
        };

        let hook = self.hook.lock().clone();
        match hook {
            Some(hook) => {
                tracing::debug!(key, payloads = group.payloads.len(), "batch finished");
                hook(key.to_string(), group.payloads).await;
            }
            None => tracing::debug!(key, "batch finished without a hook"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    type Calls = Arc<Mutex<Vec<(String, Vec<u32>)>>>;

    fn coordinator() -> (BatchCoordinator<u32>, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let c = BatchCoordinator::new();
        let sink = Arc::clone(&calls);
        c.set_finish_hook(Arc::new(move |key, payloads| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push((key, payloads));
            }
            .boxed()
        }));
        (c, calls)
    }

    #[tokio::test]
    async fn test_hook_fires_once_with_non_null_payloads() {
        let (c, calls) = coordinator();
        c.add_task("/dst", Some(1));
        c.add_task("/dst", None);
        c.add_task("/dst", Some(3));
        assert_eq!(c.pending("/dst"), 3);

        assert!(!c.mark_finish("/dst").await);
        assert!(!c.mark_finish("/dst").await);
        assert!(calls.lock().is_empty());
        assert!(c.mark_finish("/dst").await);

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("/dst".to_string(), vec![1, 3]));
    }

    #[tokio::test]
    async fn test_extra_finish_is_noop() {
        let (c, calls) = coordinator();
        c.add_task("/dst", None);
        assert!(c.mark_finish("/dst").await);
        assert!(!c.mark_finish("/dst").await);
        assert!(!c.mark_finish("/never").await);
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_new_epoch_after_drain() {
        let (c, calls) = coordinator();
        c.add_task("/dst", Some(1));
        c.mark_finish("/dst").await;
        c.add_task("/dst", Some(2));
        assert!(c.append_payload("/dst", 5));
        c.mark_finish("/dst").await;

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, vec![2, 5]);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (c, calls) = coordinator();
        c.add_task("/a", None);
        c.add_task("/b", None);
        c.mark_finish("/b").await;
        assert_eq!(c.pending("/a"), 1);
        assert!(!c.append_payload("/b", 1));
        assert_eq!(calls.lock()[0].0, "/b");
    }
}
