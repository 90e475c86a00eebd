//! Local disk storage driver.
//!
//! Provides access to a real directory tree, with path security
//! to prevent escaping the root directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::vfs::error::{VfsError, VfsResult, VfsResultExt};
use crate::vfs::ops::StorageDriver;
use crate::vfs::path;
use crate::vfs::stream::{Body, FileStream, Link, ProgressFn};
use crate::vfs::types::{Capabilities, DriverConfig, ObjectInfo};

/// Local disk storage driver.
///
/// All backend paths are relative to `root`. For example, if `root` is
/// `/srv/media`, then `/movies/a.mkv` is `/srv/media/movies/a.mkv`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    /// Create a driver rooted at the given directory.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` -> `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            read_only: false,
        }
    }

    /// Create a read-only driver.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        let mut backend = Self::new(root);
        backend.read_only = true;
        backend
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a backend path onto the disk.
    ///
    /// Returns an error if the result escapes the root through a symlink.
    fn resolve(&self, backend_path: &str) -> VfsResult<PathBuf> {
        let clean = path::fix_and_clean(backend_path);
        let rel = clean.trim_start_matches('/');
        if rel.is_empty() {
            return Ok(self.root.clone());
        }
        let full = self.root.join(rel);

        // Existing paths (or their parents) are canonicalized to catch
        // symlinks pointing outside the root.
        let anchor = if full.exists() {
            full.canonicalize()?
        } else {
            match full.parent() {
                Some(parent) if parent.exists() => {
                    let name = full
                        .file_name()
                        .ok_or_else(|| VfsError::invalid_path(clean.clone()))?;
                    parent.canonicalize()?.join(name)
                }
                _ => full.clone(),
            }
        };
        if !anchor.starts_with(&self.root) {
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                anchor.display(),
                self.root.display()
            )));
        }
        Ok(full)
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn metadata_to_info(name: &str, meta: &std::fs::Metadata) -> ObjectInfo {
        let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if meta.is_dir() {
            ObjectInfo::directory(name).with_modified(modified)
        } else {
            ObjectInfo::file(name, meta.len()).with_modified(modified)
        }
    }
}

#[async_trait]
impl StorageDriver for LocalBackend {
    fn config(&self) -> DriverConfig {
        let mut config = DriverConfig::new("local");
        config.no_upload = self.read_only;
        config.capabilities = Capabilities {
            copy: true,
            move_: true,
            rename: true,
            reference: false,
        };
        config
    }

    async fn init(&self) -> VfsResult<()> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(VfsError::from)
            .with_context(|| format!("root {}", self.root.display()))?;
        if !meta.is_dir() {
            return Err(VfsError::not_a_directory(self.root.display().to_string()));
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> VfsResult<Vec<ObjectInfo>> {
        let full = self.resolve(dir)?;
        let mut entries = Vec::new();
        let mut reader = fs::read_dir(&full).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await?;
            entries.push(Self::metadata_to_info(&name, &meta));
        }
        Ok(entries)
    }

    async fn get(&self, p: &str) -> VfsResult<ObjectInfo> {
        let full = self.resolve(p)?;
        let meta = fs::metadata(&full).await?;
        Ok(Self::metadata_to_info(path::base_name(p), &meta))
    }

    async fn link(&self, p: &str) -> VfsResult<Link> {
        let full = self.resolve(p)?;
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            return Err(VfsError::is_a_directory(p));
        }
        let file = fs::File::open(&full).await?;
        Ok(Link::new(Body::Seekable(Box::new(file)), Some(meta.len())))
    }

    async fn make_dir(&self, parent: &str, name: &str) -> VfsResult<()> {
        self.check_writable()?;
        let full = self.resolve(&path::join(parent, name))?;
        match fs::create_dir(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && full.is_dir() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, p: &str) -> VfsResult<()> {
        self.check_writable()?;
        let full = self.resolve(p)?;
        if full == self.root {
            return Err(VfsError::invalid_path("cannot remove the backend root"));
        }
        let meta = fs::symlink_metadata(&full).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn put(
        &self,
        dst_dir: &str,
        stream: &mut FileStream,
        progress: &ProgressFn<'_>,
    ) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::UploadNotSupported);
        }
        let target = self.resolve(&path::join(dst_dir, stream.name()))?;
        let mut file = fs::File::create(&target).await?;
        if let Err(e) = stream.copy_to(&mut file, progress).await {
            drop(file);
            // Partial uploads are not left behind.
            let _ = fs::remove_file(&target).await;
            return Err(e);
        }
        Ok(())
    }

    async fn move_to(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        self.check_writable()?;
        let from = self.resolve(src)?;
        let to = self.resolve(&path::join(dst_dir, path::base_name(src)))?;
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn rename(&self, src: &str, new_name: &str) -> VfsResult<()> {
        self.check_writable()?;
        let from = self.resolve(src)?;
        let to = self.resolve(&path::join(&path::parent(src), new_name))?;
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn copy_to(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        self.check_writable()?;
        let from = self.resolve(src)?;
        if fs::metadata(&from).await?.is_dir() {
            // Directory trees go through the generic per-file path.
            return Err(VfsError::not_supported("directory copy"));
        }
        let to = self.resolve(&path::join(dst_dir, path::base_name(src)))?;
        fs::copy(&from, &to).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::stream::no_progress;
    use tempfile::TempDir;

    fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let fs = LocalBackend::new(dir.path());
        (fs, dir)
    }

    #[tokio::test]
    async fn test_put_and_link() {
        let (fs, _dir) = setup();
        fs.init().await.unwrap();
        fs.make_dir("/", "docs").await.unwrap();

        let mut s = FileStream::from_bytes("a.txt", b"hello world".to_vec());
        fs.put("/docs", &mut s, &no_progress).await.unwrap();

        let obj = fs.get("/docs/a.txt").await.unwrap();
        assert!(obj.is_file());
        assert_eq!(obj.size, 11);

        let link = fs.link("/docs/a.txt").await.unwrap();
        let mut stream = FileStream::from_link(&obj, link);
        assert_eq!(stream.read_all(&no_progress).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_make_dir_is_idempotent() {
        let (fs, _dir) = setup();
        fs.make_dir("/", "a").await.unwrap();
        fs.make_dir("/", "a").await.unwrap();
        let listing = fs.list("/").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_dir());
    }

    #[tokio::test]
    async fn test_read_only() {
        let dir = TempDir::new().unwrap();
        let fs = LocalBackend::read_only(dir.path());
        assert!(matches!(
            fs.make_dir("/", "x").await.unwrap_err(),
            VfsError::ReadOnly
        ));
        assert!(fs.config().no_upload);
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (fs, dir) = setup();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("out")).unwrap();
        assert!(matches!(
            fs.list("/out").await.unwrap_err(),
            VfsError::PathEscapesRoot(_)
        ));
        // `..` is resolved lexically and cannot climb above the root.
        assert_eq!(fs.resolve("/../../etc").unwrap(), dir.path().canonicalize().unwrap().join("etc"));
    }

    #[tokio::test]
    async fn test_copy_file_and_refuse_dir() {
        let (fs, _dir) = setup();
        fs.make_dir("/", "src").await.unwrap();
        fs.make_dir("/", "dst").await.unwrap();
        let mut s = FileStream::from_bytes("x.txt", b"x".to_vec());
        fs.put("/src", &mut s, &no_progress).await.unwrap();

        fs.copy_to("/src/x.txt", "/dst").await.unwrap();
        assert!(fs.get("/dst/x.txt").await.is_ok());
        assert!(fs.copy_to("/src", "/dst").await.unwrap_err().is_not_implemented());
    }

    #[tokio::test]
    async fn test_move_and_remove() {
        let (fs, _dir) = setup();
        fs.make_dir("/", "a").await.unwrap();
        fs.make_dir("/", "b").await.unwrap();
        let mut s = FileStream::from_bytes("x.txt", b"x".to_vec());
        fs.put("/a", &mut s, &no_progress).await.unwrap();

        fs.move_to("/a/x.txt", "/b").await.unwrap();
        assert!(fs.get("/a/x.txt").await.unwrap_err().is_not_found());
        fs.remove("/b").await.unwrap();
        assert!(fs.get("/b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_init_missing_root() {
        let fs = LocalBackend::new("/definitely/not/here");
        assert!(fs.init().await.unwrap_err().is_not_found());
    }
}
