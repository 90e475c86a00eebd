//! Storage driver capability trait.
//!
//! Every backend (cloud drive, FTP, local disk, ...) implements
//! [`StorageDriver`]. The required operations cover listing, links,
//! directory creation, removal and upload; the optional ones (native copy,
//! move and rename) default to [`VfsError::NotImplemented`] so the core can
//! fall back to a generic cross-backend transfer.
//!
//! Paths are backend-relative: `/` is the backend root.

use async_trait::async_trait;
use std::sync::Arc;

use super::error::{VfsError, VfsResult};
use super::path;
use super::stream::{FileStream, Link, ProgressFn};
use super::types::{DriverConfig, ObjectInfo};

/// Core storage driver trait.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Static description of the driver.
    fn config(&self) -> DriverConfig;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect, authenticate, validate settings.
    async fn init(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Release resources. Called on unmount and before re-init.
    async fn shutdown(&self) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// List the immediate children of `dir`.
    async fn list(&self, dir: &str) -> VfsResult<Vec<ObjectInfo>>;

    /// Describe a single object.
    ///
    /// The default lists the parent directory and looks the name up.
    async fn get(&self, path: &str) -> VfsResult<ObjectInfo> {
        let name = path::base_name(path);
        if name.is_empty() {
            return Ok(ObjectInfo::directory(""));
        }
        self.list(&path::parent(path))
            .await?
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| VfsError::not_found(path))
    }

    /// Open a readable body for a file.
    async fn link(&self, path: &str) -> VfsResult<Link>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Create directory `name` inside `parent`.
    async fn make_dir(&self, parent: &str, name: &str) -> VfsResult<()>;

    /// Remove a file or a directory tree.
    async fn remove(&self, path: &str) -> VfsResult<()>;

    /// Store `stream` as `dst_dir/<stream name>`.
    async fn put(
        &self,
        dst_dir: &str,
        stream: &mut FileStream,
        progress: &ProgressFn<'_>,
    ) -> VfsResult<()>;

    // ========================================================================
    // Optional native operations
    // ========================================================================

    /// Move `src` into directory `dst_dir` within this backend.
    async fn move_to(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        let _ = (src, dst_dir);
        Err(VfsError::not_implemented("move"))
    }

    /// Rename `src` in place.
    async fn rename(&self, src: &str, new_name: &str) -> VfsResult<()> {
        let _ = (src, new_name);
        Err(VfsError::not_implemented("rename"))
    }

    /// Copy `src` into directory `dst_dir` within this backend.
    async fn copy_to(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        let _ = (src, dst_dir);
        Err(VfsError::not_implemented("copy"))
    }

    /// Reference chaining, for drivers that proxy another mounted backend.
    fn as_reference(&self) -> Option<&dyn ReferenceDriver> {
        None
    }
}

/// Optional capability: proxy another mounted driver of a compatible kind.
#[async_trait]
pub trait ReferenceDriver: Send + Sync {
    /// Hand over the referenced driver. Return [`VfsError::NotSupported`] if
    /// its kind cannot be proxied.
    async fn init_reference(&self, target: Arc<dyn StorageDriver>) -> VfsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::stream::{Body, no_progress};

    /// Driver that implements only the required operations.
    struct FlatDriver;

    #[async_trait]
    impl StorageDriver for FlatDriver {
        fn config(&self) -> DriverConfig {
            DriverConfig::new("flat")
        }

        async fn list(&self, dir: &str) -> VfsResult<Vec<ObjectInfo>> {
            match dir {
                "/" => Ok(vec![ObjectInfo::directory("docs")]),
                "/docs" => Ok(vec![ObjectInfo::file("a.txt", 3)]),
                _ => Err(VfsError::not_found(dir)),
            }
        }

        async fn link(&self, _path: &str) -> VfsResult<Link> {
            Ok(Link::new(Body::from_bytes(b"abc".to_vec()), Some(3)))
        }

        async fn make_dir(&self, _parent: &str, _name: &str) -> VfsResult<()> {
            Ok(())
        }

        async fn remove(&self, _path: &str) -> VfsResult<()> {
            Ok(())
        }

        async fn put(
            &self,
            _dst_dir: &str,
            stream: &mut FileStream,
            progress: &ProgressFn<'_>,
        ) -> VfsResult<()> {
            stream.read_all(progress).await.map(|_| ())
        }
    }

    #[tokio::test]
    async fn test_default_get_uses_parent_listing() {
        let d = FlatDriver;
        let obj = d.get("/docs/a.txt").await.unwrap();
        assert_eq!(obj.size, 3);
        assert!(d.get("/docs/missing").await.unwrap_err().is_not_found());
        assert!(d.get("/").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_optional_ops_not_implemented() {
        let d = FlatDriver;
        assert!(d.copy_to("/docs/a.txt", "/").await.unwrap_err().is_not_implemented());
        assert!(d.move_to("/docs/a.txt", "/").await.unwrap_err().is_not_implemented());
        assert!(d.rename("/docs/a.txt", "b.txt").await.unwrap_err().is_not_implemented());
        assert!(d.as_reference().is_none());

        let mut s = FileStream::from_bytes("x", b"hi".to_vec());
        d.put("/", &mut s, &no_progress).await.unwrap();
    }
}
