//! The Kernel: composition root of stowage.
//!
//! A kernel owns:
//! - The storage registry and its reconnect scheduler
//! - The filesystem operations layer and its listing cache
//! - Three task pools (transfers, uploads, syncs)
//! - The batch coordinator and pending-write counters used by transfers
//! - The sync job service
//!
//! Nothing here is global; build as many kernels as you like (tests do).

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::batch::BatchCoordinator;
use crate::config::KernelConfig;
use crate::db::{MountStore, SqliteStore, SyncJobStore};
use crate::fs::Fs;
use crate::lazy::LazyCounter;
use crate::sync::Syncer;
use crate::task::TaskManager;
use crate::transfer::{TransferPayload, Transfers};
use crate::vfs::{
    DriverFactory, Reconnect, ReconnectHandle, ReconnectScheduler, StorageRegistry, VfsError,
    VfsResult,
};

/// Wired-up storage federation services.
pub struct Kernel {
    config: KernelConfig,
    registry: Arc<StorageRegistry>,
    fs: Arc<Fs>,
    transfers: Arc<Transfers>,
    syncer: Syncer,
    reconnect: Mutex<Option<ReconnectHandle>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("registry", &self.registry)
            .field("transfers", &self.transfers)
            .field("syncer", &self.syncer)
            .finish()
    }
}

impl Kernel {
    /// Kernel backed by the SQLite database named in the config.
    ///
    /// Must be called inside a tokio runtime: the task pools and the
    /// reconnect loop start immediately.
    pub fn open(config: KernelConfig) -> VfsResult<Self> {
        let store = Arc::new(SqliteStore::open(&config.database.path)?);
        tracing::info!(path = %config.database.path.display(), "opened mount database");
        Self::with_store(config, store, DriverFactory::with_builtins())
    }

    /// Kernel with an in-memory database and the built-in drivers.
    pub fn in_memory(config: KernelConfig) -> VfsResult<Self> {
        let store = Arc::new(SqliteStore::in_memory()?);
        Self::with_store(config, store, DriverFactory::with_builtins())
    }

    /// Kernel over any store and driver table.
    pub fn with_store<S>(config: KernelConfig, store: Arc<S>, factory: DriverFactory) -> VfsResult<Self>
    where
        S: MountStore + SyncJobStore + 'static,
    {
        config
            .validate()
            .map_err(|e| VfsError::other(e.to_string()))?;

        let scheduler = Arc::new(ReconnectScheduler::new(config.reconnect.clone()));
        let registry = Arc::new(StorageRegistry::new(
            Arc::clone(&store) as Arc<dyn MountStore>,
            factory,
            Arc::clone(&scheduler),
        ));
        let weak = Arc::downgrade(&registry);
        let target: Weak<dyn Reconnect> = weak;
        let reconnect = scheduler.start(target)?;

        let tasks = &config.tasks;
        let transfer_tasks = Arc::new(TaskManager::new("transfer", tasks.transfer_workers, tasks.max_retry));
        let upload_tasks = Arc::new(TaskManager::new("upload", tasks.upload_workers, tasks.max_retry));
        let sync_tasks = Arc::new(TaskManager::new("sync", tasks.sync_workers, tasks.max_retry));
        for manager in [&transfer_tasks, &upload_tasks, &sync_tasks] {
            manager.start()?;
        }

        let fs = Arc::new(Fs::new(Arc::clone(&registry)));
        let transfers = Transfers::new(
            Arc::clone(&fs),
            Arc::new(LazyCounter::new()),
            Arc::new(BatchCoordinator::<TransferPayload>::new()),
            transfer_tasks,
            upload_tasks,
            config.transfer.clone(),
        );
        let syncer = Syncer::new(
            store as Arc<dyn SyncJobStore>,
            Arc::clone(&transfers),
            sync_tasks,
            config.sync.clone(),
        );

        Ok(Self {
            config,
            registry,
            fs,
            transfers,
            syncer,
            reconnect: Mutex::new(Some(reconnect)),
        })
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    pub fn transfers(&self) -> &Arc<Transfers> {
        &self.transfers
    }

    pub fn syncer(&self) -> &Syncer {
        &self.syncer
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Mount every enabled stored storage. Returns the mounts that failed.
    pub async fn load_storages(&self) -> VfsResult<Vec<(String, VfsError)>> {
        let failed = self.registry.load_all_storages().await?;
        tracing::info!(
            mounted = self.registry.list_mounts().len(),
            failed = failed.len(),
            "storages loaded"
        );
        Ok(failed)
    }

    /// Stop the reconnect loop, cancel outstanding tasks and drop all mounts.
    pub async fn shutdown(&self) {
        let handle = self.reconnect.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.syncer.task_manager().shutdown().await;
        self.transfers.upload_manager().shutdown().await;
        self.transfers.task_manager().shutdown().await;
        for record in self.registry.list_mounts() {
            self.registry.unmount(&record.mount_path).await;
        }
        tracing::info!("kernel shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorageRecord;

    #[tokio::test]
    async fn test_in_memory_kernel_mounts_and_lists() {
        let kernel = Kernel::in_memory(KernelConfig::default()).unwrap();
        let created = kernel
            .registry()
            .create_storage(StorageRecord::new("/scratch", "memory"))
            .await
            .unwrap();
        assert!(created.init_error.is_none());

        kernel.fs().make_dir("/scratch/a").await.unwrap();
        let names: Vec<String> = kernel
            .fs()
            .list("/", false)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["scratch"]);
        kernel.shutdown().await;
        assert!(kernel.registry().list_mounts().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = KernelConfig::default();
        config.tasks.transfer_workers = 0;
        assert!(Kernel::in_memory(config).is_err());
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.database.path = dir.path().join("stowage.db");

        let first = Kernel::open(config.clone()).unwrap();
        first
            .registry()
            .create_storage(StorageRecord::new("/mem", "memory"))
            .await
            .unwrap();
        first.shutdown().await;
        drop(first);

        let second = Kernel::open(config).unwrap();
        let failed = second.load_storages().await.unwrap();
        assert!(failed.is_empty());
        assert!(second.registry().has_storage("/mem"));
    }
}
