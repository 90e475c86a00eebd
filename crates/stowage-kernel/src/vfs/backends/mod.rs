//! Storage drivers.
//!
//! Drivers implement [`StorageDriver`](crate::vfs::StorageDriver) for
//! different storage types.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
