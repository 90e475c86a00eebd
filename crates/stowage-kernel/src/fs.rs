//! Virtual filesystem operations over the storage registry.
//!
//! Routes each virtual path to its mount, calls the driver with the backend
//! path, and keeps a listing cache keyed by (mount path, backend directory).
//! Every mutation invalidates the directories it touched.

use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::vfs::{
    Capability, FileStream, Mount, ObjectInfo, ProgressFn, StorageRegistry, VfsError, VfsResult,
    VfsResultExt, path,
};

type CacheKey = (String, String);

/// Cached, mount-aware filesystem operations.
#[derive(Debug)]
pub struct Fs {
    registry: Arc<StorageRegistry>,
    cache: DashMap<CacheKey, Arc<Vec<ObjectInfo>>>,
}

impl Fs {
    pub fn new(registry: Arc<StorageRegistry>) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    // ========================================================================
    // Listing cache
    // ========================================================================

    /// Forget the cached listing of one backend directory.
    pub fn invalidate(&self, mount: &Mount, dir: &str) {
        self.cache
            .remove(&(mount.mount_path(), path::fix_and_clean(dir)));
    }

    /// Forget cached listings of `dir` and everything beneath it.
    pub fn invalidate_tree(&self, mount: &Mount, dir: &str) {
        let mount_path = mount.mount_path();
        let dir = path::fix_and_clean(dir);
        self.cache
            .retain(|(m, d), _| !(m == &mount_path && path::is_sub_path(&dir, d)));
    }

    /// Forget the cached listing behind a virtual directory path.
    pub fn clear_cache(&self, virtual_path: &str) {
        if let Ok((mount, actual)) = self.registry.resolve(virtual_path) {
            self.invalidate(&mount, &actual);
        }
    }

    pub fn cached_dirs(&self) -> usize {
        self.cache.len()
    }

    /// List a backend directory through the cache.
    pub async fn list_backend(
        &self,
        mount: &Mount,
        dir: &str,
        refresh: bool,
    ) -> VfsResult<Vec<ObjectInfo>> {
        let dir = path::fix_and_clean(dir);
        let cacheable = !mount.config().no_cache;
        let key = (mount.mount_path(), dir.clone());
        if cacheable && !refresh {
            if let Some(hit) = self.cache.get(&key) {
                return Ok(hit.value().as_ref().clone());
            }
        }
        let objs = mount
            .driver()
            .list(&dir)
            .await
            .with_context(|| format!("list {} on {}", dir, mount.mount_path()))?;
        if cacheable {
            self.cache.insert(key, Arc::new(objs.clone()));
        }
        Ok(objs)
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    /// List a virtual directory, merging in mount points beneath it.
    pub async fn list(&self, dir: &str, refresh: bool) -> VfsResult<Vec<ObjectInfo>> {
        let dir = path::fix_and_clean(dir);
        let virtual_children = self.registry.list_virtual_children(&dir);

        let objs = match self.registry.resolve(&dir) {
            Ok((mount, actual)) => match self.list_backend(&mount, &actual, refresh).await {
                Ok(objs) => objs,
                Err(e) if !virtual_children.is_empty() => {
                    tracing::warn!(path = %dir, error = %e, "listing failed, showing mount points only");
                    Vec::new()
                }
                Err(e) => return Err(e),
            },
            Err(_) if !virtual_children.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };

        // Mount points shadow same-named backend entries.
        let names: HashSet<String> = virtual_children.iter().map(|o| o.name.clone()).collect();
        let mut merged = virtual_children;
        merged.extend(objs.into_iter().filter(|o| !names.contains(&o.name)));
        Ok(merged)
    }

    /// Describe one object.
    pub async fn get(&self, virtual_path: &str) -> VfsResult<ObjectInfo> {
        let virtual_path = path::fix_and_clean(virtual_path);
        match self.registry.resolve(&virtual_path) {
            Ok((mount, actual)) => {
                if actual == "/" {
                    return Ok(ObjectInfo::directory(path::base_name(&virtual_path)));
                }
                mount
                    .driver()
                    .get(&actual)
                    .await
                    .with_context(|| format!("get {}", virtual_path))
            }
            Err(e) => {
                if virtual_path == "/"
                    || !self.registry.list_virtual_children(&virtual_path).is_empty()
                {
                    Ok(ObjectInfo::directory(path::base_name(&virtual_path)))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Open an object for reading.
    pub async fn open(&self, virtual_path: &str) -> VfsResult<FileStream> {
        let (mount, actual) = self.registry.resolve(virtual_path)?;
        let obj = mount.driver().get(&actual).await?;
        if obj.is_dir() {
            return Err(VfsError::is_a_directory(virtual_path));
        }
        let link = mount
            .driver()
            .link(&actual)
            .await
            .with_context(|| format!("link {}", virtual_path))?;
        Ok(FileStream::from_link(&obj, link))
    }

    /// Breadth-first walk of `root` up to `max_depth` levels, keyed by path
    /// relative to `root`. The root itself is not included.
    pub async fn walk(
        &self,
        root: &str,
        max_depth: usize,
        refresh: bool,
    ) -> VfsResult<IndexMap<String, ObjectInfo>> {
        let root = path::fix_and_clean(root);
        let mut out = IndexMap::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(String::new(), 0)]);

        while let Some((rel, level)) = queue.pop_front() {
            if level >= max_depth {
                continue;
            }
            let children = self.list(&path::join(&root, &rel), refresh).await?;
            for child in children {
                let child_rel = if rel.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}/{}", rel, child.name)
                };
                if child.is_dir() {
                    queue.push_back((child_rel.clone(), level + 1));
                }
                out.insert(child_rel, child);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create `virtual_path` and every missing ancestor.
    pub async fn make_dir(&self, virtual_path: &str) -> VfsResult<()> {
        let (mount, actual) = self.registry.resolve(virtual_path)?;
        self.ensure_dir(&mount, &actual).await
    }

    async fn ensure_dir(&self, mount: &Mount, dir: &str) -> VfsResult<()> {
        let driver = mount.driver();
        let mut missing = Vec::new();
        let mut current = path::fix_and_clean(dir);
        while current != "/" {
            match driver.get(&current).await {
                Ok(obj) if obj.is_dir() => break,
                Ok(_) => return Err(VfsError::not_a_directory(current)),
                Err(e) if e.is_not_found() => {
                    let parent = path::parent(&current);
                    missing.push(current);
                    current = parent;
                }
                Err(e) => return Err(e),
            }
        }

        for dir in missing.into_iter().rev() {
            let parent = path::parent(&dir);
            driver
                .make_dir(&parent, path::base_name(&dir))
                .await
                .with_context(|| format!("make dir {} on {}", dir, mount.mount_path()))?;
            self.invalidate(mount, &parent);
        }
        Ok(())
    }

    /// Remove an object. Removing something absent succeeds.
    pub async fn remove(&self, virtual_path: &str) -> VfsResult<()> {
        let (mount, actual) = self.registry.resolve(virtual_path)?;
        if actual == "/" {
            return Err(VfsError::invalid_path(format!(
                "{} is a storage root",
                virtual_path
            )));
        }
        match mount.driver().remove(&actual).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %virtual_path, "remove of absent object");
            }
            Err(e) => return Err(e.context(format!("remove {}", virtual_path))),
        }
        self.invalidate(&mount, &path::parent(&actual));
        self.invalidate_tree(&mount, &actual);
        Ok(())
    }

    /// Rename in place.
    pub async fn rename(&self, virtual_path: &str, new_name: &str) -> VfsResult<()> {
        let (mount, actual) = self.registry.resolve(virtual_path)?;
        if !mount.config().supports(Capability::Rename) {
            return Err(VfsError::not_implemented("rename"));
        }
        mount
            .driver()
            .rename(&actual, new_name)
            .await
            .with_context(|| format!("rename {}", virtual_path))?;
        self.invalidate(&mount, &path::parent(&actual));
        self.invalidate_tree(&mount, &actual);
        Ok(())
    }

    /// Native copy within one mount. `NotImplemented` / `NotSupported` mean
    /// the caller should stream instead.
    pub async fn copy_native(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        let (mount, src_actual, dst_actual) = self.same_mount(src, dst_dir, Capability::Copy)?;
        mount.driver().copy_to(&src_actual, &dst_actual).await?;
        self.invalidate(&mount, &dst_actual);
        Ok(())
    }

    /// Native move within one mount.
    pub async fn move_native(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        let (mount, src_actual, dst_actual) = self.same_mount(src, dst_dir, Capability::Move)?;
        mount.driver().move_to(&src_actual, &dst_actual).await?;
        self.invalidate(&mount, &dst_actual);
        self.invalidate(&mount, &path::parent(&src_actual));
        self.invalidate_tree(&mount, &src_actual);
        Ok(())
    }

    fn same_mount(
        &self,
        src: &str,
        dst_dir: &str,
        cap: Capability,
    ) -> VfsResult<(Arc<Mount>, String, String)> {
        let (src_mount, src_actual) = self.registry.resolve(src)?;
        let (dst_mount, dst_actual) = self.registry.resolve(dst_dir)?;
        if !Arc::ptr_eq(&src_mount, &dst_mount) {
            return Err(VfsError::not_supported("native operation across storages"));
        }
        if !src_mount.config().supports(cap) {
            return Err(VfsError::not_implemented(format!("{:?}", cap).to_lowercase()));
        }
        Ok((src_mount, src_actual, dst_actual))
    }

    /// Upload `stream` into the directory `dst_dir`.
    pub async fn put(
        &self,
        dst_dir: &str,
        stream: &mut FileStream,
        progress: &ProgressFn<'_>,
    ) -> VfsResult<()> {
        let (mount, actual) = self.registry.resolve(dst_dir)?;
        self.put_resolved(&mount, &actual, stream, progress).await
    }

    pub(crate) async fn put_resolved(
        &self,
        mount: &Mount,
        dst_dir: &str,
        stream: &mut FileStream,
        progress: &ProgressFn<'_>,
    ) -> VfsResult<()> {
        if mount.config().no_upload {
            return Err(VfsError::UploadNotSupported);
        }
        let result = mount
            .driver()
            .put(dst_dir, stream, progress)
            .await
            .with_context(|| format!("put {} into {} on {}", stream.name(), dst_dir, mount.mount_path()));
        self.invalidate(mount, dst_dir);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::db::{MemoryStore, MountStore, StorageRecord};
    use crate::vfs::{DriverFactory, MemoryBackend, ReconnectScheduler, no_progress};

    async fn fs_with(mounts: &[(&str, Arc<MemoryBackend>)]) -> Fs {
        let registry = Arc::new(StorageRegistry::new(
            Arc::new(MemoryStore::new()) as Arc<dyn MountStore>,
            DriverFactory::with_builtins(),
            Arc::new(ReconnectScheduler::new(ReconnectConfig::default())),
        ));
        for (mount_path, backend) in mounts {
            registry
                .mount(StorageRecord::new(*mount_path, "memory"), backend.clone())
                .await
                .unwrap();
        }
        Fs::new(registry)
    }

    #[tokio::test]
    async fn test_list_merges_mount_points() {
        let root = Arc::new(MemoryBackend::new());
        root.write_file("/docs/readme.txt", "hi").unwrap();
        root.write_file("/media", "shadowed file").unwrap();
        let media = Arc::new(MemoryBackend::new());
        let fs = fs_with(&[("/", root), ("/media", media)]).await;

        let names: Vec<String> = fs.list("/", false).await.unwrap().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["media", "docs"]);
        assert!(fs.get("/media").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_virtual_only_directory() {
        let fs = fs_with(&[("/a/b", Arc::new(MemoryBackend::new()))]).await;
        let listing = fs.list("/a", false).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "b");
        assert!(fs.get("/a").await.unwrap().is_dir());
        assert!(fs.list("/zzz", false).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_and_refresh() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write_file("/d/one.txt", "1").unwrap();
        let fs = fs_with(&[("/", backend.clone())]).await;

        assert_eq!(fs.list("/d", false).await.unwrap().len(), 1);
        backend.write_file("/d/two.txt", "2").unwrap();
        assert_eq!(fs.list("/d", false).await.unwrap().len(), 1);
        assert_eq!(fs.list("/d", true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mutations_invalidate() {
        let backend = Arc::new(MemoryBackend::new());
        let fs = fs_with(&[("/", backend.clone())]).await;
        fs.make_dir("/x").await.unwrap();
        assert_eq!(fs.list("/x", false).await.unwrap().len(), 0);

        let mut stream = FileStream::from_bytes("f.txt", "data");
        fs.put("/x", &mut stream, &no_progress).await.unwrap();
        assert_eq!(fs.list("/x", false).await.unwrap().len(), 1);

        fs.remove("/x/f.txt").await.unwrap();
        assert!(fs.list("/x", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_make_dir_creates_ancestors() {
        let backend = Arc::new(MemoryBackend::new());
        let fs = fs_with(&[("/m", backend.clone())]).await;
        fs.make_dir("/m/a/b/c").await.unwrap();
        assert!(backend.exists("/a/b/c"));
        // Idempotent.
        fs.make_dir("/m/a/b").await.unwrap();

        backend.write_file("/file", "x").unwrap();
        assert!(matches!(
            fs.make_dir("/m/file/sub").await,
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_absent_is_ok() {
        let fs = fs_with(&[("/", Arc::new(MemoryBackend::new()))]).await;
        fs.remove("/nothing/here").await.unwrap();
        assert!(fs.remove("/").await.is_err());
    }

    #[tokio::test]
    async fn test_put_rejected_by_no_upload() {
        let backend = Arc::new(MemoryBackend::new().with_no_upload(true));
        let fs = fs_with(&[("/ro", backend)]).await;
        let mut stream = FileStream::from_bytes("f.txt", "data");
        let err = fs.put("/ro", &mut stream, &no_progress).await.unwrap_err();
        assert!(matches!(err, VfsError::UploadNotSupported));
    }

    #[tokio::test]
    async fn test_native_ops_need_same_mount() {
        let a = Arc::new(MemoryBackend::new());
        a.write_file("/f.txt", "x").unwrap();
        a.write_file("/dst/.keep", "").unwrap();
        let b = Arc::new(MemoryBackend::new());
        let fs = fs_with(&[("/a", a.clone()), ("/b", b)]).await;

        assert!(fs.copy_native("/a/f.txt", "/b").await.unwrap_err().is_not_implemented());
        fs.copy_native("/a/f.txt", "/a/dst").await.unwrap();
        assert!(a.exists("/dst/f.txt"));
    }

    #[tokio::test]
    async fn test_native_ops_respect_capabilities() {
        let a = Arc::new(MemoryBackend::new().with_native_ops(false));
        a.write_file("/f.txt", "x").unwrap();
        let fs = fs_with(&[("/a", a)]).await;
        let err = fs.copy_native("/a/f.txt", "/a").await.unwrap_err();
        assert!(err.is_not_implemented());
        assert!(fs.rename("/a/f.txt", "g.txt").await.unwrap_err().is_not_implemented());
    }

    #[tokio::test]
    async fn test_walk_is_breadth_first_and_bounded() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write_file("/r/a/deep/x.txt", "x").unwrap();
        backend.write_file("/r/b.txt", "b").unwrap();
        let fs = fs_with(&[("/", backend)]).await;

        let all = fs.walk("/r", 10, false).await.unwrap();
        let keys: Vec<&str> = all.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b.txt", "a/deep", "a/deep/x.txt"]);

        let shallow = fs.walk("/r", 2, false).await.unwrap();
        assert!(shallow.contains_key("a/deep"));
        assert!(!shallow.contains_key("a/deep/x.txt"));
    }
}
