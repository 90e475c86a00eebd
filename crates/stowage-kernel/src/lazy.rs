//! Per-key pending-write counters.
//!
//! A writer calls [`LazyCounter::increment`] before streaming into a
//! destination and [`LazyCounter::decrement_if_exists`] afterwards. A reader
//! that must trust a fresh listing of that destination calls
//! [`LazyCounter::wait`] until every write started so far has finished.

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::watch;

/// Count-and-wait primitive keyed by destination path.
#[derive(Debug, Default)]
pub struct LazyCounter {
    counters: DashMap<String, watch::Sender<i64>>,
}

impl LazyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, key: &str) -> watch::Sender<i64> {
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| watch::Sender::new(0))
            .clone()
    }

    /// Add one pending write for `key`.
    pub fn increment(&self, key: &str) {
        self.sender(key).send_modify(|v| *v += 1);
    }

    /// Retire one pending write. Returns the new count, or `None` if the key
    /// is not tracked.
    pub fn decrement_if_exists(&self, key: &str) -> Option<i64> {
        let sender = self.counters.get(key)?.clone();
        let mut now = 0;
        sender.send_modify(|v| {
            *v -= 1;
            now = *v;
        });
        drop(sender);
        self.forget_if_idle(key);
        Some(now)
    }

    /// Drop the entry for `key` once it is drained and nobody waits on it.
    fn forget_if_idle(&self, key: &str) {
        self.counters
            .remove_if(key, |_, s| *s.borrow() <= 0 && s.receiver_count() == 0);
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    /// Current count for `key` (0 if unknown).
    pub fn count(&self, key: &str) -> i64 {
        self.counters.get(key).map(|s| *s.borrow()).unwrap_or(0)
    }

    /// Wait until `key` has no pending writes. Returns false on timeout.
    ///
    /// An untracked key has nothing pending and returns at once.
    pub async fn wait(&self, key: &str, timeout: Duration) -> bool {
        let Some(mut rx) = self.counters.get(key).map(|s| s.subscribe()) else {
            return true;
        };
        let drained = tokio::time::timeout(timeout, rx.wait_for(|v| *v <= 0))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        drop(rx);
        self.forget_if_idle(key);
        drained
    }
}

/// Holds one pending write for a key until dropped.
pub struct PendingWrite<'a> {
    counter: &'a LazyCounter,
    key: String,
}

impl<'a> PendingWrite<'a> {
    pub fn new(counter: &'a LazyCounter, key: impl Into<String>) -> Self {
        let key = key.into();
        counter.increment(&key);
        Self { counter, key }
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        self.counter.decrement_if_exists(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_on_unknown_key_is_immediate() {
        let c = LazyCounter::new();
        assert!(c.wait("/nothing", Duration::from_millis(10)).await);
        assert_eq!(c.decrement_if_exists("/never"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_drained() {
        let c = Arc::new(LazyCounter::new());
        c.increment("/dst");
        c.increment("/dst");

        let waiter = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.wait("/dst", Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert_eq!(c.decrement_if_exists("/dst"), Some(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert_eq!(c.decrement_if_exists("/dst"), Some(0));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let c = LazyCounter::new();
        c.increment("/dst");
        assert!(!c.wait("/dst", Duration::from_secs(5)).await);
        assert_eq!(c.count("/dst"), 1);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let c = LazyCounter::new();
        {
            let _guard = PendingWrite::new(&c, "/dst");
            assert_eq!(c.count("/dst"), 1);
        }
        assert_eq!(c.count("/dst"), 0);
    }

    #[tokio::test]
    async fn test_drained_keys_are_forgotten() {
        let c = Arc::new(LazyCounter::new());
        for i in 0..100 {
            let key = format!("/dst/{i}");
            let _guard = PendingWrite::new(&c, key.as_str());
            assert_eq!(c.tracked_keys(), 1);
        }
        assert!(c.wait("/dst/7", Duration::from_millis(10)).await);
        assert_eq!(c.tracked_keys(), 0);

        c.increment("/dst");
        let waiter = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.wait("/dst", Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // the waiter still holds the entry
        assert_eq!(c.decrement_if_exists("/dst"), Some(0));
        assert!(waiter.await.unwrap());
        assert_eq!(c.tracked_keys(), 0);
    }
}
