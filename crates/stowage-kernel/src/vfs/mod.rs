//! Storage federation layer.
//!
//! Key components:
//!
//! - [`StorageDriver`] - Capability trait every backend implements
//! - [`StorageRegistry`] - Routes virtual paths to mounted drivers
//! - [`ReconnectScheduler`] - Retries failed mounts with backoff
//! - [`DriverFactory`] - Builds drivers from mount records
//! - [`MemoryBackend`] / [`LocalBackend`] - Built-in drivers
//!
//! ## Design Decisions
//!
//! - **String paths**: virtual and backend paths are slash separated
//!   strings, normalized by [`path::fix_and_clean`].
//! - **Longest-prefix routing**: the registry routes to the most specific
//!   mount point that matches; `.balance` mounts share a virtual path.
//! - **Optional capabilities**: native copy/move/rename answer
//!   `NotImplemented` by default so callers fall back to streaming.

pub mod backends;
mod error;
mod factory;
mod mount;
mod ops;
pub mod path;
mod reconnect;
mod stream;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult, VfsResultExt};
pub use factory::{DriverConstructor, DriverFactory};
pub use mount::{CreatedStorage, Mount, STATUS_DISABLED, STATUS_WORK, StorageRegistry};
pub use ops::{ReferenceDriver, StorageDriver};
pub use reconnect::{
    AttemptOutcome, Reconnect, ReconnectHandle, ReconnectPhase, ReconnectScheduler,
    ReconnectStatus,
};
pub use stream::{Body, FileStream, Link, ProgressFn, SeekRead, no_progress};
pub use types::{Capabilities, Capability, DriverConfig, FileType, ObjectInfo};
