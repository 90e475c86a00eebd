//! # stowage-kernel
//!
//! Storage federation core for stowage.
//!
//! Many heterogeneous backends are mounted into one virtual namespace. The
//! kernel routes virtual paths to backends, keeps failed mounts reconnecting,
//! and moves data between backends as tasks:
//! - Copy / move / upload with a native fast path inside one backend
//! - Directory transfers fanned out into per-object tasks, finalized once
//! - Moves that only delete a source after verifying its copy
//! - Directory sync in six modes

pub mod batch;
pub mod config;
pub mod db;
pub mod fs;
pub mod kernel;
pub mod lazy;
pub mod sync;
pub mod task;
pub mod transfer;
pub mod vfs;

pub use batch::{BatchCoordinator, FinishHook};
pub use config::{
    ConfigError, DatabaseConfig, KernelConfig, MoveVerifyPolicy, ReconnectConfig, SyncConfig,
    TaskConfig, TransferConfig,
};
pub use db::{
    AutoReconnect, MemoryStore, MountStore, SqliteStore, StorageRecord, StoreError, StoreResult,
    SyncJob, SyncJobStore,
};
pub use fs::Fs;
pub use kernel::Kernel;
pub use lazy::{LazyCounter, PendingWrite};
pub use sync::{ChildKind, ChildTaskInfo, SyncMode, SyncPhase, SyncTask, Syncer};
pub use task::{Task, TaskCore, TaskInfo, TaskManager, TaskState};
pub use transfer::{
    FinalizeReport, TransferKind, TransferOutcome, TransferPayload, TransferTask, Transfers,
    UploadTask,
};
pub use vfs::{
    CreatedStorage, DriverConfig, DriverFactory, FileStream, FileType, LocalBackend,
    MemoryBackend, Mount, ObjectInfo, StorageDriver, StorageRegistry, VfsError, VfsResult,
};
