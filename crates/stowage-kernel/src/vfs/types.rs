//! Core VFS types.
//!
//! These types are backend-neutral and serializable so task snapshots and
//! listings can be handed to presentation layers unchanged.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Object descriptor returned by listings and lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Entry type.
    pub kind: FileType,
    /// Last modification time.
    pub modified: SystemTime,
}

impl ObjectInfo {
    /// Describe a file.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            kind: FileType::File,
            modified: SystemTime::now(),
        }
    }

    /// Describe a directory.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: FileType::Directory,
            modified: SystemTime::now(),
        }
    }

    /// Override the modification time.
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }
}

/// Optional driver operations the core can query before calling them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// In-place copy within the backend.
    Copy,
    /// In-place move within the backend.
    Move,
    /// In-place rename.
    Rename,
    /// Proxying another mounted backend.
    Reference,
}

/// Set of optional capabilities a driver declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub copy: bool,
    pub move_: bool,
    pub rename: bool,
    pub reference: bool,
}

impl Capabilities {
    /// Every optional operation.
    pub fn all() -> Self {
        Self {
            copy: true,
            move_: true,
            rename: true,
            reference: false,
        }
    }

    /// Returns true if `cap` is declared.
    pub fn supports(&self, cap: Capability) -> bool {
        match cap {
            Capability::Copy => self.copy,
            Capability::Move => self.move_,
            Capability::Rename => self.rename,
            Capability::Reference => self.reference,
        }
    }
}

/// Static driver description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver name, as used in mount records.
    pub name: String,
    /// Listings come back already sorted.
    pub local_sort: bool,
    /// Backend root used when the record leaves it empty.
    pub default_root: String,
    /// The backend refuses uploads.
    pub no_upload: bool,
    /// Listings must never be cached.
    pub no_cache: bool,
    /// Optional operations.
    pub capabilities: Capabilities,
}

impl DriverConfig {
    /// Create a config with the given name and no optional capabilities.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_sort: false,
            default_root: "/".to_string(),
            no_upload: false,
            no_cache: false,
            capabilities: Capabilities::default(),
        }
    }

    /// Returns true if `cap` is declared.
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.supports(cap)
    }
}
