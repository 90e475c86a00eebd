//! VFS error types.
//!
//! The variants follow the error taxonomy of the federation core: routing
//! errors, capability errors (recovered locally by the generic transfer path),
//! reconnection errors, verification errors and cancellation.

use std::io;
use thiserror::Error;

use crate::db::StoreError;

/// Everything a VFS, task or transfer operation can fail with.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A backend path resolved outside the backend root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("filesystem is read-only")]
    ReadOnly,

    /// Routing found no mount for the path.
    #[error("no mount point for path: {0}")]
    NoMountPoint(String),

    /// The backend does not implement this operation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The backend refuses this operation for this object.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The destination storage does not accept uploads.
    #[error("upload not supported")]
    UploadNotSupported,

    /// The mount exists but its backend is not usable.
    #[error("storage {mount_path} is not ready: {status}")]
    StorageNotReady { mount_path: String, status: String },

    /// Backend initialization failed.
    #[error("failed init storage {mount_path}: {message}")]
    StorageInit { mount_path: String, message: String },

    /// No driver registered under this name.
    #[error("driver not found: {0}")]
    DriverNotFound(String),

    /// A move could not confirm its destination copy.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The operation was cancelled.
    #[error("canceled")]
    Canceled,

    /// Persistence error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An error with added context (which path, which backend).
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<VfsError>,
    },

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn no_mount_point(path: impl Into<String>) -> Self {
        Self::NoMountPoint(path.into())
    }

    pub fn not_implemented(op: impl Into<String>) -> Self {
        Self::NotImplemented(op.into())
    }

    pub fn not_supported(op: impl Into<String>) -> Self {
        Self::NotSupported(op.into())
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Wrap this error with context.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any context wrappers.
    pub fn root(&self) -> &VfsError {
        match self {
            VfsError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for "not implemented" / "not supported": the caller may fall back
    /// to the generic cross-backend path.
    pub fn is_not_implemented(&self) -> bool {
        matches!(
            self.root(),
            VfsError::NotImplemented(_) | VfsError::NotSupported(_)
        )
    }

    /// True if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            VfsError::NotFound(_) => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True if this error represents cancellation rather than failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self.root(), VfsError::Canceled)
    }
}

/// Attach context to a failed [`VfsResult`].
pub trait VfsResultExt<T> {
    /// Wrap the error (if any) with a lazily built context message.
    fn with_context<F, S>(self, f: F) -> VfsResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> VfsResultExt<T> for VfsResult<T> {
    fn with_context<F, S>(self, f: F) -> VfsResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_classification() {
        let err = VfsError::not_implemented("copy")
            .context("copy /a/x.txt")
            .context("mount /a");
        assert!(err.is_not_implemented());
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "mount /a: copy /a/x.txt: not implemented: copy");
    }

    #[test]
    fn test_io_not_found_is_not_found() {
        let err = VfsError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_canceled_is_not_failure_kind() {
        let err = VfsError::Canceled.context("put /b/x.txt");
        assert!(err.is_canceled());
        assert!(!err.is_not_implemented());
    }
}
