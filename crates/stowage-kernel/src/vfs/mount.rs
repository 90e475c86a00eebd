//! Storage registry with longest-prefix routing.
//!
//! Maps mount paths to live drivers. A virtual path is routed to the mount
//! with the longest matching prefix. Several mounts may share one virtual
//! path through the `.balance` suffix (`/a/d/e`, `/a/d/e.balance1`); calls
//! that land on such a path are spread round-robin across them.
//!
//! Mounts whose backend failed to initialize stay registered with their
//! error as status, so a failed mount reports why rather than vanishing.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::error::{VfsError, VfsResult};
use super::factory::DriverFactory;
use super::ops::StorageDriver;
use super::path;
use super::reconnect::{Reconnect, ReconnectScheduler};
use super::types::{DriverConfig, ObjectInfo};
use crate::db::{MountStore, StorageRecord, now_secs};

/// Status of a mount whose backend is usable.
pub const STATUS_WORK: &str = "work";
/// Status of a disabled mount.
pub const STATUS_DISABLED: &str = "disabled";

/// A registered mount: its record and its driver.
pub struct Mount {
    record: RwLock<StorageRecord>,
    driver: Arc<dyn StorageDriver>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.read();
        f.debug_struct("Mount")
            .field("mount_path", &record.mount_path)
            .field("driver", &record.driver)
            .field("status", &record.status)
            .finish()
    }
}

impl Mount {
    fn new(record: StorageRecord, driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            record: RwLock::new(record),
            driver,
        }
    }

    pub fn mount_path(&self) -> String {
        self.record.read().mount_path.clone()
    }

    /// Mount path with any balance suffix removed.
    pub fn virtual_path(&self) -> String {
        path::actual_mount_path(&self.record.read().mount_path).to_string()
    }

    pub fn record(&self) -> StorageRecord {
        self.record.read().clone()
    }

    pub fn status(&self) -> String {
        self.record.read().status.clone()
    }

    pub fn is_working(&self) -> bool {
        self.record.read().status == STATUS_WORK
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn config(&self) -> DriverConfig {
        self.driver.config()
    }

    fn set_status(&self, status: impl Into<String>) -> StorageRecord {
        let mut record = self.record.write();
        record.status = status.into();
        record.clone()
    }
}

/// Result of [`StorageRegistry::create_storage`].
#[derive(Debug)]
pub struct CreatedStorage {
    pub id: u64,
    /// The record was stored but the backend did not come up.
    pub init_error: Option<VfsError>,
}

/// Storage registry.
pub struct StorageRegistry {
    /// Mounts keyed by normalized mount path.
    mounts: DashMap<String, Arc<Mount>>,
    /// Round-robin counters keyed by virtual path.
    balance: DashMap<String, usize>,
    store: Arc<dyn MountStore>,
    factory: DriverFactory,
    reconnect: Arc<ReconnectScheduler>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("mounts", &self.mounts.len())
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl StorageRegistry {
    pub fn new(
        store: Arc<dyn MountStore>,
        factory: DriverFactory,
        reconnect: Arc<ReconnectScheduler>,
    ) -> Self {
        Self {
            mounts: DashMap::new(),
            balance: DashMap::new(),
            store,
            factory,
            reconnect,
        }
    }

    pub fn reconnect_scheduler(&self) -> &Arc<ReconnectScheduler> {
        &self.reconnect
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Mount registered at exactly `mount_path`.
    pub fn get_storage(&self, mount_path: &str) -> Option<Arc<Mount>> {
        self.mounts
            .get(&path::fix_and_clean(mount_path))
            .map(|m| Arc::clone(m.value()))
    }

    pub fn has_storage(&self, mount_path: &str) -> bool {
        self.mounts.contains_key(&path::fix_and_clean(mount_path))
    }

    /// All mounts sharing the longest prefix match for `virtual_path`,
    /// sorted by mount path.
    pub fn storages_by_path(&self, virtual_path: &str) -> Vec<Arc<Mount>> {
        let virtual_path = path::fix_and_clean(virtual_path);
        let mut best_depth = 0usize;
        let mut found: Vec<Arc<Mount>> = Vec::new();

        for entry in self.mounts.iter() {
            let actual = path::actual_mount_path(entry.key());
            if !path::is_sub_path(actual, &virtual_path) {
                continue;
            }
            // Slash count of the mount path with a trailing separator:
            // `/` counts 1, `/a` counts 2, `/a/b` counts 3.
            let depth = path::depth(actual) + 1;
            if depth > best_depth {
                found.clear();
                best_depth = depth;
            }
            if depth == best_depth {
                found.push(Arc::clone(entry.value()));
            }
        }

        found.sort_by_key(|m| m.mount_path());
        found
    }

    /// Pick a mount for `virtual_path`, cycling through balanced mounts.
    pub fn pick_balanced(&self, virtual_path: &str) -> Option<Arc<Mount>> {
        let mut candidates = self.storages_by_path(virtual_path);
        match candidates.len() {
            0 => None,
            1 => candidates.pop(),
            n => {
                let key = candidates[0].virtual_path();
                let index = {
                    let mut counter = self.balance.entry(key).or_insert(0);
                    *counter = (*counter + 1) % n;
                    *counter
                };
                Some(Arc::clone(&candidates[index]))
            }
        }
    }

    /// Route a virtual path to a working mount and the backend path inside it.
    pub fn resolve(&self, virtual_path: &str) -> VfsResult<(Arc<Mount>, String)> {
        let virtual_path = path::fix_and_clean(virtual_path);
        let mount = self
            .pick_balanced(&virtual_path)
            .ok_or_else(|| VfsError::no_mount_point(virtual_path.clone()))?;
        if !mount.is_working() {
            return Err(VfsError::StorageNotReady {
                mount_path: mount.mount_path(),
                status: mount.status(),
            });
        }
        let rel = path::relative(&mount.virtual_path(), &virtual_path).unwrap_or_default();
        Ok((mount, path::join("/", &rel)))
    }

    /// Folder entries for mount-point segments directly beneath `prefix`.
    ///
    /// With mounts `/a/b`, `/a/c`, `/a/d/e` and `/a/b.balance1`, the prefix
    /// `/a` yields `b`, `c`, `d`.
    pub fn list_virtual_children(&self, prefix: &str) -> Vec<ObjectInfo> {
        let prefix = path::fix_and_clean(prefix);
        let mut mounts: Vec<(i32, String, i64)> = self
            .mounts
            .iter()
            .map(|m| {
                let record = m.value().record.read();
                (record.order, record.mount_path.clone(), record.modified)
            })
            .collect();
        mounts.sort();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, mount_path, modified) in mounts {
            let actual = path::actual_mount_path(&mount_path);
            if prefix.len() >= actual.len() || !path::is_sub_path(&prefix, actual) {
                continue;
            }
            let rest = actual[prefix.len()..].trim_start_matches('/');
            let name = rest.split('/').next().unwrap_or_default();
            if !name.is_empty() && seen.insert(name.to_string()) {
                let modified = std::time::UNIX_EPOCH
                    + std::time::Duration::from_secs(modified.max(0) as u64);
                out.push(ObjectInfo::directory(name).with_modified(modified));
            }
        }
        out
    }

    /// Every registered mount's record, sorted by order then mount path.
    pub fn list_mounts(&self) -> Vec<StorageRecord> {
        let mut records: Vec<_> = self.mounts.iter().map(|m| m.value().record()).collect();
        records.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.mount_path.cmp(&b.mount_path))
        });
        records
    }

    // ========================================================================
    // Programmatic mounting
    // ========================================================================

    /// Register a caller-built driver and initialize it.
    ///
    /// The mount stays registered when init fails; the error is returned and
    /// reconnection is scheduled if the record asks for it. A driver already
    /// mounted at the same path is shut down and replaced.
    pub async fn mount(&self, mut record: StorageRecord, driver: Arc<dyn StorageDriver>) -> VfsResult<()> {
        record.mount_path = path::fix_and_clean(&record.mount_path);
        let previous = self
            .mounts
            .get(&record.mount_path)
            .map(|m| Arc::clone(m.value()));
        if let Some(previous) = previous {
            tracing::info!(mount_path = %record.mount_path, "replacing mounted storage");
            if let Err(e) = previous.driver.shutdown().await {
                tracing::warn!(mount_path = %record.mount_path, error = %e, "driver shutdown failed");
            }
        }
        self.init_with_reconnect(record, driver).await
    }

    /// Drop a mount. Returns false if nothing was mounted there.
    pub async fn unmount(&self, mount_path: &str) -> bool {
        let mount_path = path::fix_and_clean(mount_path);
        self.reconnect.remove(&mount_path);
        match self.mounts.remove(&mount_path) {
            Some((_, mount)) => {
                if let Err(e) = mount.driver.shutdown().await {
                    tracing::warn!(mount_path = %mount_path, error = %e, "driver shutdown failed");
                }
                tracing::info!(mount_path = %mount_path, "unmounted storage");
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Persistent lifecycle
    // ========================================================================

    /// Store a new mount record, then instantiate and initialize its driver.
    ///
    /// The id is returned even when init fails.
    pub async fn create_storage(&self, mut record: StorageRecord) -> VfsResult<CreatedStorage> {
        record.modified = now_secs();
        record.mount_path = path::fix_and_clean(&record.mount_path);
        let driver = self.factory.create(&record.driver, &record.addition)?;
        let id = self.store.create_storage(&record)?;
        record.id = id;

        let init_error = self.init_storage(record, driver).await.err();
        if let Some(e) = &init_error {
            tracing::warn!(id, error = %e, "storage created but init failed");
        }
        Ok(CreatedStorage { id, init_error })
    }

    /// Bring a stored record online.
    pub async fn load_storage(&self, mut record: StorageRecord) -> VfsResult<()> {
        record.mount_path = path::fix_and_clean(&record.mount_path);
        let driver = self.factory.create(&record.driver, &record.addition)?;
        self.init_with_reconnect(record, driver).await
    }

    /// Load every enabled record, in `order`. Returns the failures.
    pub async fn load_all_storages(&self) -> VfsResult<Vec<(String, VfsError)>> {
        let records = self.store.list_storages()?;
        let mut failures = Vec::new();
        let mut loaded = 0usize;
        for record in records.into_iter().filter(|r| !r.disabled) {
            let mount_path = record.mount_path.clone();
            match self.load_storage(record).await {
                Ok(()) => loaded += 1,
                Err(e) => {
                    tracing::warn!(mount_path = %mount_path, error = %e, "failed to load storage");
                    failures.push((mount_path, e));
                }
            }
        }
        tracing::info!(loaded, failed = failures.len(), "loaded storages");
        Ok(failures)
    }

    pub async fn enable_storage(&self, id: u64) -> VfsResult<()> {
        let mut record = self.stored(id)?;
        if !record.disabled {
            return Err(VfsError::other(format!("storage {} is already enabled", id)));
        }
        record.disabled = false;
        self.store.update_storage(&record)?;
        self.load_storage(record).await
    }

    pub async fn disable_storage(&self, id: u64) -> VfsResult<()> {
        let mut record = self.stored(id)?;
        if record.disabled {
            return Err(VfsError::other(format!("storage {} is already disabled", id)));
        }
        let mount = self
            .get_storage(&record.mount_path)
            .ok_or_else(|| VfsError::no_mount_point(record.mount_path.clone()))?;
        mount.driver.shutdown().await?;

        record.disabled = true;
        record.status = STATUS_DISABLED.to_string();
        self.store.update_storage(&record)?;
        self.mounts.remove(&record.mount_path);
        self.reconnect.remove(&record.mount_path);
        tracing::info!(mount_path = %record.mount_path, "disabled storage");
        Ok(())
    }

    /// Replace a stored record and re-initialize its mount.
    ///
    /// The driver cannot change. A changed mount path drops the old key.
    pub async fn update_storage(&self, mut record: StorageRecord) -> VfsResult<()> {
        let old = self.stored(record.id)?;
        if old.driver != record.driver {
            return Err(VfsError::other("driver cannot be changed"));
        }
        record.modified = now_secs();
        record.mount_path = path::fix_and_clean(&record.mount_path);
        self.store.update_storage(&record)?;
        if record.disabled {
            return Ok(());
        }

        let previous = if old.mount_path != record.mount_path {
            self.reconnect.remove(&old.mount_path);
            self.mounts.remove(&old.mount_path).map(|(_, m)| m)
        } else {
            self.get_storage(&old.mount_path)
        };
        let previous =
            previous.ok_or_else(|| VfsError::no_mount_point(old.mount_path.clone()))?;
        previous.driver.shutdown().await?;

        let driver = self.factory.create(&record.driver, &record.addition)?;
        self.init_storage(record, driver).await
    }

    pub async fn delete_storage(&self, id: u64) -> VfsResult<()> {
        let record = self.stored(id)?;
        if !record.disabled {
            let mount = self
                .get_storage(&record.mount_path)
                .ok_or_else(|| VfsError::no_mount_point(record.mount_path.clone()))?;
            mount.driver.shutdown().await?;
            self.mounts.remove(&record.mount_path);
            self.reconnect.remove(&record.mount_path);
        }
        self.store.delete_storage(id)?;
        tracing::info!(id, mount_path = %record.mount_path, "deleted storage");
        Ok(())
    }

    fn stored(&self, id: u64) -> VfsResult<StorageRecord> {
        self.store
            .get_storage(id)?
            .ok_or_else(|| VfsError::Store(crate::db::StoreError::NotFound(format!("storage {}", id))))
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    async fn init_with_reconnect(
        &self,
        record: StorageRecord,
        driver: Arc<dyn StorageDriver>,
    ) -> VfsResult<()> {
        let result = self.init_storage(record.clone(), Arc::clone(&driver)).await;
        if result.is_err() && record.auto_reconnect.enabled {
            self.reconnect.add_or_update(record, driver);
        } else {
            self.reconnect.remove(&record.mount_path);
        }
        result
    }

    /// Chain references, run driver init, register the mount whatever the
    /// outcome, and persist the resulting status.
    async fn init_storage(&self, record: StorageRecord, driver: Arc<dyn StorageDriver>) -> VfsResult<()> {
        let mount_path = record.mount_path.clone();
        let result = match self.chain_reference(&record, &driver).await {
            Ok(()) => match AssertUnwindSafe(driver.init()).catch_unwind().await {
                Ok(res) => res,
                Err(panic) => Err(VfsError::other(format!("[panic] {}", panic_message(panic.as_ref())))),
            },
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(()) => STATUS_WORK.to_string(),
            Err(e) => e.to_string(),
        };
        let mount = Arc::new(Mount::new(record, driver));
        let snapshot = mount.set_status(status);
        self.mounts.insert(mount_path.clone(), mount);
        self.persist(&snapshot);

        match result {
            Ok(()) => {
                tracing::info!(mount_path = %mount_path, driver = %snapshot.driver, "storage ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(mount_path = %mount_path, error = %e, "failed init storage");
                Err(VfsError::StorageInit {
                    mount_path,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn chain_reference(
        &self,
        record: &StorageRecord,
        driver: &Arc<dyn StorageDriver>,
    ) -> VfsResult<()> {
        let (Some(reference), Some(target_path)) = (driver.as_reference(), record.reference_path())
        else {
            return Ok(());
        };
        let target = self
            .get_storage(target_path)
            .ok_or_else(|| VfsError::other(format!("ref: no mount path for a storage is: {}", target_path)))?;
        match reference.init_reference(Arc::clone(&target.driver)).await {
            Err(VfsError::NotSupported(_)) => Err(VfsError::other(format!(
                "ref: storage is not {}",
                driver.config().name
            ))),
            other => other,
        }
    }

    /// Write a status change back. Failures are logged only.
    fn persist(&self, record: &StorageRecord) {
        if record.id == 0 {
            return;
        }
        if let Err(e) = self.store.update_storage(record) {
            tracing::error!(mount_path = %record.mount_path, error = %e, "failed save storage");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Reconnect for StorageRegistry {
    async fn reconnect(&self, record: &StorageRecord, driver: Arc<dyn StorageDriver>) -> VfsResult<()> {
        if let Err(e) = driver.shutdown().await {
            tracing::debug!(mount_path = %record.mount_path, error = %e, "shutdown before reconnect failed");
        }
        self.init_storage(record.clone(), driver).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::db::{AutoReconnect, MemoryStore};
    use crate::vfs::backends::MemoryBackend;
    use crate::vfs::ops::ReferenceDriver;
    use crate::vfs::stream::{FileStream, Link, ProgressFn};

    fn registry() -> (StorageRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(ReconnectScheduler::new(ReconnectConfig::default()));
        let registry = StorageRegistry::new(
            store.clone() as Arc<dyn MountStore>,
            DriverFactory::with_builtins(),
            scheduler,
        );
        (registry, store)
    }

    async fn mount_mem(r: &StorageRegistry, mount_path: &str, order: i32) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        r.mount(
            StorageRecord::new(mount_path, "memory").with_order(order),
            backend.clone(),
        )
        .await
        .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_longest_prefix_resolution() {
        let (r, _) = registry();
        mount_mem(&r, "/", 0).await;
        mount_mem(&r, "/a", 0).await;
        mount_mem(&r, "/a/b", 0).await;

        let (m, p) = r.resolve("/a/b/c/d.txt").unwrap();
        assert_eq!(m.mount_path(), "/a/b");
        assert_eq!(p, "/c/d.txt");

        let (m, p) = r.resolve("/a/bc").unwrap();
        assert_eq!(m.mount_path(), "/a");
        assert_eq!(p, "/bc");

        let (m, p) = r.resolve("/z").unwrap();
        assert_eq!(m.mount_path(), "/");
        assert_eq!(p, "/z");

        let (m, p) = r.resolve("/a/b/").unwrap();
        assert_eq!(m.mount_path(), "/a/b");
        assert_eq!(p, "/");
    }

    #[tokio::test]
    async fn test_no_mount_point() {
        let (r, _) = registry();
        mount_mem(&r, "/a", 0).await;
        assert!(matches!(r.resolve("/b/x"), Err(VfsError::NoMountPoint(_))));
    }

    #[tokio::test]
    async fn test_balanced_round_robin_is_fair() {
        let (r, _) = registry();
        mount_mem(&r, "/a/d/e", 0).await;
        mount_mem(&r, "/a/d/e.balance1", 0).await;
        mount_mem(&r, "/a/d/e.balance2", 0).await;

        assert_eq!(r.storages_by_path("/a/d/e/f").len(), 3);

        let mut counts = std::collections::HashMap::new();
        let k = 10;
        for _ in 0..k {
            let (m, p) = r.resolve("/a/d/e/f.txt").unwrap();
            assert_eq!(p, "/f.txt");
            *counts.entry(m.mount_path()).or_insert(0usize) += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count == k / 3 || *count == k / 3 + 1, "{counts:?}");
        }
    }

    #[tokio::test]
    async fn test_balanced_pick_order() {
        let (r, _) = registry();
        mount_mem(&r, "/m", 0).await;
        mount_mem(&r, "/m.balance", 0).await;
        let picks: Vec<_> = (0..4)
            .map(|_| r.pick_balanced("/m/x").unwrap().mount_path())
            .collect();
        assert_eq!(picks, vec!["/m.balance", "/m", "/m.balance", "/m"]);
    }

    #[tokio::test]
    async fn test_virtual_children() {
        let (r, _) = registry();
        mount_mem(&r, "/a/c", 2).await;
        mount_mem(&r, "/a/b", 1).await;
        mount_mem(&r, "/a/d/e", 3).await;
        mount_mem(&r, "/a/b.balance1", 1).await;
        mount_mem(&r, "/av", 0).await;

        let names: Vec<_> = r
            .list_virtual_children("/a")
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["b", "c", "d"]);

        let root: Vec<_> = r.list_virtual_children("/").into_iter().map(|o| o.name).collect();
        assert_eq!(root, vec!["av", "a"]);
        assert!(r.list_virtual_children("/a/b").is_empty());
    }

    #[tokio::test]
    async fn test_failed_mount_surfaces_status() {
        let (r, _) = registry();
        let backend = Arc::new(MemoryBackend::new().with_init_failures(1));
        let err = r
            .mount(StorageRecord::new("/flaky", "memory"), backend)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::StorageInit { .. }));

        let mount = r.get_storage("/flaky").unwrap();
        assert_eq!(mount.status(), "backend unavailable");
        match r.resolve("/flaky/x") {
            Err(VfsError::StorageNotReady { status, .. }) => assert_eq!(status, "backend unavailable"),
            other => panic!("expected not ready, got {other:?}"),
        }
        assert!(!r.reconnect_scheduler().contains("/flaky"));
    }

    #[tokio::test]
    async fn test_failed_mount_schedules_reconnect_then_recovers() {
        let (r, _) = registry();
        let backend = Arc::new(MemoryBackend::new().with_init_failures(1));
        let record = StorageRecord::new("/flaky", "memory").with_auto_reconnect(AutoReconnect {
            enabled: true,
            initial_interval_secs: 1,
            max_attempts: 3,
        });
        assert!(r.mount(record, backend).await.is_err());
        assert!(r.reconnect_scheduler().contains("/flaky"));

        let outcome = r
            .reconnect_scheduler()
            .attempt(&r, "/flaky", None)
            .await;
        assert_eq!(outcome, crate::vfs::reconnect::AttemptOutcome::Reconnected);
        assert!(r.resolve("/flaky/x").is_ok());

        assert!(r.unmount("/flaky").await);
        assert!(!r.unmount("/flaky").await);
    }

    #[tokio::test]
    async fn test_persistent_lifecycle() {
        let (r, store) = registry();
        let created = r
            .create_storage(StorageRecord::new("/mem/", "memory"))
            .await
            .unwrap();
        assert!(created.init_error.is_none());
        let id = created.id;
        assert_eq!(store.get_storage(id).unwrap().unwrap().status, STATUS_WORK);
        assert!(r.has_storage("/mem"));

        r.disable_storage(id).await.unwrap();
        assert!(!r.has_storage("/mem"));
        let stored = store.get_storage(id).unwrap().unwrap();
        assert!(stored.disabled);
        assert_eq!(stored.status, STATUS_DISABLED);
        assert!(r.disable_storage(id).await.is_err());

        r.enable_storage(id).await.unwrap();
        assert!(r.resolve("/mem/x").is_ok());

        let mut moved = store.get_storage(id).unwrap().unwrap();
        moved.mount_path = "/elsewhere".into();
        r.update_storage(moved.clone()).await.unwrap();
        assert!(!r.has_storage("/mem"));
        assert!(r.has_storage("/elsewhere"));

        moved.driver = "local".into();
        assert!(r.update_storage(moved).await.is_err());

        r.delete_storage(id).await.unwrap();
        assert!(!r.has_storage("/elsewhere"));
        assert!(store.get_storage(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_returns_id_when_init_fails() {
        let (r, store) = registry();
        let created = r
            .create_storage(
                StorageRecord::new("/disk", "local").with_addition(r#"{"root":"/no/such/dir"}"#),
            )
            .await
            .unwrap();
        assert!(created.init_error.is_some());
        let stored = store.get_storage(created.id).unwrap().unwrap();
        assert_ne!(stored.status, STATUS_WORK);
        assert!(r.has_storage("/disk"));
    }

    #[tokio::test]
    async fn test_load_all_skips_disabled() {
        let (r, store) = registry();
        store.create_storage(&StorageRecord::new("/one", "memory")).unwrap();
        let mut disabled = StorageRecord::new("/two", "memory");
        disabled.disabled = true;
        store.create_storage(&disabled).unwrap();
        store.create_storage(&StorageRecord::new("/three", "nope")).unwrap();

        let failures = r.load_all_storages().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "/three");
        assert!(r.has_storage("/one"));
        assert!(!r.has_storage("/two"));
    }

    /// Driver whose init panics.
    struct Panicky;

    #[async_trait]
    impl StorageDriver for Panicky {
        fn config(&self) -> DriverConfig {
            DriverConfig::new("panicky")
        }
        async fn init(&self) -> VfsResult<()> {
            panic!("boom");
        }
        async fn list(&self, _: &str) -> VfsResult<Vec<ObjectInfo>> {
            Ok(vec![])
        }
        async fn link(&self, p: &str) -> VfsResult<Link> {
            Err(VfsError::not_found(p))
        }
        async fn make_dir(&self, _: &str, _: &str) -> VfsResult<()> {
            Ok(())
        }
        async fn remove(&self, _: &str) -> VfsResult<()> {
            Ok(())
        }
        async fn put(&self, _: &str, _: &mut FileStream, _: &ProgressFn<'_>) -> VfsResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_init_panic_is_caught() {
        let (r, _) = registry();
        assert!(r.mount(StorageRecord::new("/p", "panicky"), Arc::new(Panicky)).await.is_err());
        assert_eq!(r.get_storage("/p").unwrap().status(), "[panic] boom");
    }

    /// Driver that proxies only memory drivers.
    struct Alias {
        target: parking_lot::Mutex<Option<Arc<dyn StorageDriver>>>,
    }

    #[async_trait]
    impl ReferenceDriver for Alias {
        async fn init_reference(&self, target: Arc<dyn StorageDriver>) -> VfsResult<()> {
            if target.config().name != "memory" {
                return Err(VfsError::not_supported("reference"));
            }
            *self.target.lock() = Some(target);
            Ok(())
        }
    }

    #[async_trait]
    impl StorageDriver for Alias {
        fn config(&self) -> DriverConfig {
            DriverConfig::new("alias")
        }
        async fn init(&self) -> VfsResult<()> {
            if self.target.lock().is_none() {
                return Err(VfsError::other("no reference"));
            }
            Ok(())
        }
        async fn list(&self, dir: &str) -> VfsResult<Vec<ObjectInfo>> {
            let target = self.target.lock().clone().ok_or_else(|| VfsError::other("no reference"))?;
            target.list(dir).await
        }
        async fn link(&self, p: &str) -> VfsResult<Link> {
            Err(VfsError::not_found(p))
        }
        async fn make_dir(&self, _: &str, _: &str) -> VfsResult<()> {
            Ok(())
        }
        async fn remove(&self, _: &str) -> VfsResult<()> {
            Ok(())
        }
        async fn put(&self, _: &str, _: &mut FileStream, _: &ProgressFn<'_>) -> VfsResult<()> {
            Ok(())
        }
        fn as_reference(&self) -> Option<&dyn ReferenceDriver> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn test_reference_chaining() {
        let (r, _) = registry();
        let base = mount_mem(&r, "/base", 0).await;
        base.write_file("/hello.txt", "hi").unwrap();

        let alias = Arc::new(Alias {
            target: parking_lot::Mutex::new(None),
        });
        r.mount(
            StorageRecord::new("/alias", "alias").with_remark("ref:/base\nmirror"),
            alias.clone(),
        )
        .await
        .unwrap();
        let listing = alias.list("/").await.unwrap();
        assert_eq!(listing[0].name, "hello.txt");

        r.mount(StorageRecord::new("/p", "panicky"), Arc::new(Panicky)).await.ok();
        let other = Arc::new(Alias {
            target: parking_lot::Mutex::new(None),
        });
        let err = r
            .mount(StorageRecord::new("/alias2", "alias").with_remark("ref:/p"), other)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ref: storage is not alias"), "{err}");
    }

    /// Memory driver that counts shutdowns.
    #[derive(Default)]
    struct Closable {
        inner: MemoryBackend,
        shutdowns: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl StorageDriver for Closable {
        fn config(&self) -> DriverConfig {
            self.inner.config()
        }
        async fn shutdown(&self) -> VfsResult<()> {
            self.shutdowns.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn list(&self, dir: &str) -> VfsResult<Vec<ObjectInfo>> {
            self.inner.list(dir).await
        }
        async fn link(&self, p: &str) -> VfsResult<Link> {
            self.inner.link(p).await
        }
        async fn make_dir(&self, parent: &str, name: &str) -> VfsResult<()> {
            self.inner.make_dir(parent, name).await
        }
        async fn remove(&self, p: &str) -> VfsResult<()> {
            self.inner.remove(p).await
        }
        async fn put(&self, dir: &str, stream: &mut FileStream, progress: &ProgressFn<'_>) -> VfsResult<()> {
            self.inner.put(dir, stream, progress).await
        }
    }

    #[tokio::test]
    async fn test_remount_shuts_down_replaced_driver() {
        let (r, _) = registry();
        let first = Arc::new(Closable::default());
        r.mount(StorageRecord::new("/m", "memory"), first.clone()).await.unwrap();

        let second = Arc::new(Closable::default());
        second.inner.write_file("/new.txt", "n").unwrap();
        r.mount(StorageRecord::new("/m/", "memory"), second.clone()).await.unwrap();

        assert_eq!(first.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(second.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(r.list_mounts().len(), 1);
        let (m, _) = r.resolve("/m/new.txt").unwrap();
        assert_eq!(m.driver().list("/").await.unwrap()[0].name, "new.txt");

        assert!(r.unmount("/m").await);
        assert_eq!(second.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
