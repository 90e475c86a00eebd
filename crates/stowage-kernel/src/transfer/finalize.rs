//! Batch finish hook: refresh listings and finish moves.
//!
//! A move only deletes a source after confirming, level by level, that an
//! object of the same name exists under the destination. A subtree that
//! fails verification keeps its sources; its siblings are handled on their
//! own.

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{TransferPayload, Transfers};
use crate::config::MoveVerifyPolicy;
use crate::vfs::{VfsError, VfsResult, path};

/// Reports kept for lookup; the oldest is evicted past this.
pub const MAX_REPORTS: usize = 256;

/// Outcome of finishing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReport {
    /// Sources verified and removed.
    pub removed: Vec<String>,
    /// Sources kept, with the reason.
    pub failed: Vec<(String, String)>,
}

impl FinalizeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Transfers {
    /// Report of the most recent batch finished under `key`.
    pub fn finalize_report(&self, key: &str) -> Option<FinalizeReport> {
        self.reports.lock().get(key).cloned()
    }

    /// Remove and return the report stored under `key`.
    pub fn take_report(&self, key: &str) -> Option<FinalizeReport> {
        self.reports.lock().shift_remove(key)
    }

    /// Drop every stored report.
    pub fn clear_reports(&self) {
        self.reports.lock().clear();
    }

    fn store_report(&self, key: String, report: FinalizeReport) {
        store_bounded(&mut self.reports.lock(), key, report, MAX_REPORTS);
    }

    pub(super) async fn finalize(self: Arc<Self>, key: String, payloads: Vec<TransferPayload>) {
        if let Ok((mount, actual)) = self.fs.registry().resolve(&key) {
            self.fs.invalidate_tree(&mount, &actual);
        }

        let mut moves = Vec::new();
        for payload in payloads {
            match payload {
                TransferPayload::Refresh { path } => self.fs.clear_cache(&path),
                TransferPayload::MoveSource { src_path, dst_dir } => moves.push((src_path, dst_dir)),
            }
        }
        if moves.is_empty() {
            tracing::debug!(key = %key, "batch finalized");
            return;
        }

        if !self.lazy.wait(&key, self.config.lazy_wait_timeout).await {
            tracing::warn!(key = %key, "timed out waiting for pending writes, verifying anyway");
        }

        let report = self.verify_all(&moves).await;
        if report.is_clean() {
            tracing::info!(key = %key, removed = report.removed.len(), "move finalized");
        } else {
            for (src, reason) in &report.failed {
                tracing::warn!(key = %key, src = %src, reason = %reason, "move source kept");
            }
            if let MoveVerifyPolicy::Retry { attempts, delay_secs } = self.config.move_verify {
                let failed: Vec<(String, String)> = moves
                    .into_iter()
                    .filter(|(src, _)| report.failed.iter().any(|(f, _)| f == src))
                    .collect();
                self.schedule_reverify(key.clone(), failed, attempts, Duration::from_secs(delay_secs));
            }
        }
        self.store_report(key, report);
    }

    async fn verify_all(&self, moves: &[(String, String)]) -> FinalizeReport {
        let mut report = FinalizeReport::default();
        for (src, dst_dir) in moves {
            match self.verify_and_remove(src, dst_dir).await {
                Ok(()) => report.removed.push(src.clone()),
                Err(e) => report.failed.push((src.clone(), e.to_string())),
            }
        }
        report
    }

    fn schedule_reverify(
        self: &Arc<Self>,
        key: String,
        mut pending: Vec<(String, String)>,
        attempts: u32,
        delay: Duration,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(delay).await;
                let Some(transfers) = weak.upgrade() else {
                    return;
                };
                let report = transfers.verify_all(&pending).await;
                pending.retain(|(src, _)| report.failed.iter().any(|(f, _)| f == src));
                tracing::info!(
                    key = %key,
                    attempt,
                    removed = report.removed.len(),
                    remaining = pending.len(),
                    "move re-verification"
                );
                if let Some(stored) = transfers.reports.lock().get_mut(&key) {
                    stored.failed.retain(|(f, _)| !report.removed.contains(f));
                    stored.removed.extend(report.removed);
                }
                if pending.is_empty() {
                    return;
                }
            }
            tracing::warn!(key = %key, remaining = pending.len(), "giving up on move re-verification");
        });
    }

    /// Remove `src` once an object of the same name exists in `dst_dir`.
    ///
    /// Directories recurse; a directory is only removed when every child
    /// was. A source that no longer exists counts as done.
    pub fn verify_and_remove<'a>(
        &'a self,
        src: &'a str,
        dst_dir: &'a str,
    ) -> BoxFuture<'a, VfsResult<()>> {
        async move {
            let obj = match self.fs.get(src).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };

            let present = self
                .fs
                .list(dst_dir, true)
                .await?
                .into_iter()
                .any(|o| o.name == obj.name && o.is_dir() == obj.is_dir());
            let dst = path::join(dst_dir, &obj.name);
            if !present {
                return Err(VfsError::verification(format!("{} not found", dst)));
            }

            if obj.is_dir() {
                let mut failed = 0usize;
                for child in self.fs.list(src, true).await? {
                    let child_src = path::join(src, &child.name);
                    if let Err(e) = self.verify_and_remove(&child_src, &dst).await {
                        tracing::warn!(src = %child_src, error = %e, "verify and remove failed");
                        failed += 1;
                    }
                }
                if failed > 0 {
                    return Err(VfsError::verification(format!(
                        "some subitems of [{}] failed to verify and remove",
                        src
                    )));
                }
            }

            self.fs.remove(src).await
        }
        .boxed()
    }
}

/// Insert `report` as the newest entry, evicting the oldest past `cap`.
fn store_bounded(
    reports: &mut IndexMap<String, FinalizeReport>,
    key: String,
    report: FinalizeReport,
    cap: usize,
) {
    reports.shift_remove(&key);
    reports.insert(key, report);
    while reports.len() > cap {
        reports.shift_remove_index(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(src: &str) -> FinalizeReport {
        FinalizeReport {
            removed: vec![src.to_string()],
            failed: Vec::new(),
        }
    }

    #[test]
    fn test_reports_evict_oldest() {
        let mut reports = IndexMap::new();
        for i in 0..5 {
            store_bounded(&mut reports, format!("/k{i}"), removed("/s"), 3);
        }
        let keys: Vec<&str> = reports.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/k2", "/k3", "/k4"]);
    }

    #[test]
    fn test_rewritten_report_becomes_newest() {
        let mut reports = IndexMap::new();
        store_bounded(&mut reports, "/a".to_string(), removed("/old"), 2);
        store_bounded(&mut reports, "/b".to_string(), removed("/b"), 2);
        store_bounded(&mut reports, "/a".to_string(), removed("/new"), 2);
        store_bounded(&mut reports, "/c".to_string(), removed("/c"), 2);

        assert!(!reports.contains_key("/b"));
        assert_eq!(reports["/a"].removed, vec!["/new".to_string()]);
    }
}
