//! In-memory storage driver.
//!
//! Used for scratch mounts and testing. All data is ephemeral.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::StorageDriver;
use crate::vfs::path;
use crate::vfs::stream::{Body, FileStream, Link, ProgressFn};
use crate::vfs::types::{Capabilities, DriverConfig, ObjectInfo};

/// Entry in the memory store.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, modified: SystemTime },
    Directory { modified: SystemTime },
}

impl Entry {
    fn info(&self, name: &str) -> ObjectInfo {
        match self {
            Entry::File { data, modified } => {
                ObjectInfo::file(name, data.len() as u64).with_modified(*modified)
            }
            Entry::Directory { modified } => ObjectInfo::directory(name).with_modified(*modified),
        }
    }

    fn dir() -> Self {
        Entry::Directory {
            modified: SystemTime::now(),
        }
    }
}

/// In-memory storage driver.
///
/// Thread-safe via internal `RwLock`, keyed by normalized backend path.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    native_ops: bool,
    streaming_links: bool,
    no_upload: bool,
    /// Remaining `init` calls that fail before one succeeds.
    init_failures: AtomicU32,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty store.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), Entry::dir());
        Self {
            entries: RwLock::new(entries),
            native_ops: true,
            streaming_links: false,
            no_upload: false,
            init_failures: AtomicU32::new(0),
        }
    }

    /// Toggle native copy/move/rename.
    pub fn with_native_ops(mut self, enabled: bool) -> Self {
        self.native_ops = enabled;
        self
    }

    /// Hand out forward-only bodies from `link`, like a network backend.
    pub fn with_streaming_links(mut self, enabled: bool) -> Self {
        self.streaming_links = enabled;
        self
    }

    /// Refuse uploads.
    pub fn with_no_upload(mut self, no_upload: bool) -> Self {
        self.no_upload = no_upload;
        self
    }

    /// Make the next `n` calls to `init` fail.
    pub fn with_init_failures(self, n: u32) -> Self {
        self.init_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Write a file, creating parent directories.
    pub fn write_file(&self, file_path: &str, data: impl Into<Vec<u8>>) -> VfsResult<()> {
        let file_path = path::fix_and_clean(file_path);
        let mut entries = self.write_lock()?;
        Self::ensure_dirs(&mut entries, &path::parent(&file_path));
        entries.insert(
            file_path,
            Entry::File {
                data: data.into(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Read a file's contents, if present.
    pub fn read_file(&self, file_path: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read().ok()?;
        match entries.get(&path::fix_and_clean(file_path)) {
            Some(Entry::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// True if anything exists at `path`.
    pub fn exists(&self, p: &str) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(&path::fix_and_clean(p)))
            .unwrap_or(false)
    }

    fn read_lock(&self) -> VfsResult<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|_| VfsError::other("lock poisoned"))
    }

    fn write_lock(&self) -> VfsResult<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|_| VfsError::other("lock poisoned"))
    }

    /// Ensure `dir` and all of its ancestors exist as directories.
    fn ensure_dirs(entries: &mut HashMap<String, Entry>, dir: &str) {
        let mut current = String::new();
        for seg in dir.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(seg);
            entries.entry(current.clone()).or_insert_with(Entry::dir);
        }
    }

    fn require_dir(entries: &HashMap<String, Entry>, dir: &str) -> VfsResult<()> {
        match entries.get(dir) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(VfsError::not_a_directory(dir)),
            None => Err(VfsError::not_found(dir)),
        }
    }

    /// Keys of `root` and everything beneath it.
    fn subtree_keys(entries: &HashMap<String, Entry>, root: &str) -> Vec<String> {
        let prefix = format!("{}/", root);
        entries
            .keys()
            .filter(|k| k.as_str() == root || k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Copy (or move) subtree `src` to `dst`, both normalized.
    fn transplant(&self, src: &str, dst: &str, remove_source: bool) -> VfsResult<()> {
        if src == "/" {
            return Err(VfsError::invalid_path("cannot transfer the backend root"));
        }
        if path::is_sub_path(src, dst) {
            return Err(VfsError::invalid_path(format!("{} into itself", src)));
        }
        let mut entries = self.write_lock()?;
        if !entries.contains_key(src) {
            return Err(VfsError::not_found(src));
        }
        Self::require_dir(&entries, &path::parent(dst))?;
        if entries.contains_key(dst) {
            return Err(VfsError::already_exists(dst));
        }
        for key in Self::subtree_keys(&entries, src) {
            let target = format!("{}{}", dst, &key[src.len()..]);
            let entry = if remove_source {
                entries.remove(&key)
            } else {
                entries.get(&key).cloned()
            };
            if let Some(entry) = entry {
                entries.insert(target, entry);
            }
        }
        Ok(())
    }

    fn native_guard(&self, op: &str) -> VfsResult<()> {
        if self.native_ops {
            Ok(())
        } else {
            Err(VfsError::not_implemented(op))
        }
    }
}

#[async_trait]
impl StorageDriver for MemoryBackend {
    fn config(&self) -> DriverConfig {
        let mut config = DriverConfig::new("memory");
        config.local_sort = true;
        config.no_upload = self.no_upload;
        if self.native_ops {
            config.capabilities = Capabilities::all();
        }
        config
    }

    async fn init(&self) -> VfsResult<()> {
        let remaining = self.init_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.init_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(VfsError::other("backend unavailable"));
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> VfsResult<Vec<ObjectInfo>> {
        let dir = path::fix_and_clean(dir);
        let entries = self.read_lock()?;
        Self::require_dir(&entries, &dir)?;

        let mut out: Vec<ObjectInfo> = entries
            .iter()
            .filter(|(k, _)| k.as_str() != "/" && path::parent(k) == dir)
            .map(|(k, e)| e.info(path::base_name(k)))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get(&self, p: &str) -> VfsResult<ObjectInfo> {
        let p = path::fix_and_clean(p);
        let entries = self.read_lock()?;
        entries
            .get(&p)
            .map(|e| e.info(path::base_name(&p)))
            .ok_or_else(|| VfsError::not_found(p.clone()))
    }

    async fn link(&self, p: &str) -> VfsResult<Link> {
        let p = path::fix_and_clean(p);
        let data = {
            let entries = self.read_lock()?;
            match entries.get(&p) {
                Some(Entry::File { data, .. }) => data.clone(),
                Some(Entry::Directory { .. }) => return Err(VfsError::is_a_directory(p)),
                None => return Err(VfsError::not_found(p)),
            }
        };
        let size = Some(data.len() as u64);
        let body = if self.streaming_links {
            Body::Stream(Box::new(std::io::Cursor::new(data)))
        } else {
            Body::from_bytes(data)
        };
        Ok(Link::new(body, size))
    }

    async fn make_dir(&self, parent: &str, name: &str) -> VfsResult<()> {
        let parent = path::fix_and_clean(parent);
        let target = path::join(&parent, name);
        let mut entries = self.write_lock()?;
        Self::require_dir(&entries, &parent)?;
        match entries.get(&target) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(VfsError::already_exists(target)),
            None => {
                entries.insert(target, Entry::dir());
                Ok(())
            }
        }
    }

    async fn remove(&self, p: &str) -> VfsResult<()> {
        let p = path::fix_and_clean(p);
        if p == "/" {
            return Err(VfsError::invalid_path("cannot remove the backend root"));
        }
        let mut entries = self.write_lock()?;
        if !entries.contains_key(&p) {
            return Err(VfsError::not_found(p));
        }
        for key in Self::subtree_keys(&entries, &p) {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn put(
        &self,
        dst_dir: &str,
        stream: &mut FileStream,
        progress: &ProgressFn<'_>,
    ) -> VfsResult<()> {
        if self.no_upload {
            return Err(VfsError::UploadNotSupported);
        }
        let dst_dir = path::fix_and_clean(dst_dir);
        Self::require_dir(&*self.read_lock()?, &dst_dir)?;

        let data = stream.read_all(progress).await?;
        let target = path::join(&dst_dir, stream.name());

        let mut entries = self.write_lock()?;
        if let Some(Entry::Directory { .. }) = entries.get(&target) {
            return Err(VfsError::is_a_directory(target));
        }
        entries.insert(
            target,
            Entry::File {
                data,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn move_to(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        self.native_guard("move")?;
        let src = path::fix_and_clean(src);
        let dst = path::join(dst_dir, path::base_name(&src));
        self.transplant(&src, &dst, true)
    }

    async fn rename(&self, src: &str, new_name: &str) -> VfsResult<()> {
        self.native_guard("rename")?;
        let src = path::fix_and_clean(src);
        let dst = path::join(&path::parent(&src), new_name);
        self.transplant(&src, &dst, true)
    }

    async fn copy_to(&self, src: &str, dst_dir: &str) -> VfsResult<()> {
        self.native_guard("copy")?;
        let src = path::fix_and_clean(src);
        let dst = path::join(dst_dir, path::base_name(&src));
        self.transplant(&src, &dst, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::stream::no_progress;

    #[tokio::test]
    async fn test_put_list_link() {
        let fs = MemoryBackend::new();
        fs.make_dir("/", "docs").await.unwrap();
        let mut s = FileStream::from_bytes("a.txt", b"hello".to_vec());
        fs.put("/docs", &mut s, &no_progress).await.unwrap();

        let listing = fs.list("/docs").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "a.txt");
        assert_eq!(listing[0].size, 5);

        let link = fs.link("/docs/a.txt").await.unwrap();
        assert!(link.body.is_seekable());
        assert_eq!(link.size, Some(5));
        assert_eq!(fs.read_file("/docs/a.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_shallow() {
        let fs = MemoryBackend::new();
        fs.write_file("/b.txt", "b").unwrap();
        fs.write_file("/a/deep.txt", "d").unwrap();
        let names: Vec<_> = fs.list("/").await.unwrap().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["a", "b.txt"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir() {
        let fs = MemoryBackend::new();
        assert!(fs.list("/nope").await.unwrap_err().is_not_found());
        fs.write_file("/f", "x").unwrap();
        assert!(matches!(
            fs.list("/f").await.unwrap_err(),
            VfsError::NotADirectory(_)
        ));
    }

    #[tokio::test]
    async fn test_native_copy_and_move_subtree() {
        let fs = MemoryBackend::new();
        fs.write_file("/src/d/x.txt", "x").unwrap();
        fs.make_dir("/", "dst").await.unwrap();

        fs.copy_to("/src/d", "/dst").await.unwrap();
        assert_eq!(fs.read_file("/dst/d/x.txt").unwrap(), b"x");
        assert!(fs.exists("/src/d/x.txt"));

        fs.make_dir("/", "moved").await.unwrap();
        fs.move_to("/src/d", "/moved").await.unwrap();
        assert!(!fs.exists("/src/d"));
        assert_eq!(fs.read_file("/moved/d/x.txt").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_native_ops_disabled() {
        let fs = MemoryBackend::new().with_native_ops(false);
        fs.write_file("/a.txt", "a").unwrap();
        assert!(fs.copy_to("/a.txt", "/").await.unwrap_err().is_not_implemented());
        assert!(!fs.config().capabilities.copy);
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let fs = MemoryBackend::new();
        fs.write_file("/dir/a.txt", "a").unwrap();
        fs.rename("/dir/a.txt", "b.txt").await.unwrap();
        assert!(fs.exists("/dir/b.txt"));
        fs.remove("/dir").await.unwrap();
        assert!(!fs.exists("/dir/b.txt"));
        assert!(fs.remove("/dir").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_init_failures_then_success() {
        let fs = MemoryBackend::new().with_init_failures(2);
        assert!(fs.init().await.is_err());
        assert!(fs.init().await.is_err());
        fs.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_upload() {
        let fs = MemoryBackend::new().with_no_upload(true);
        let mut s = FileStream::from_bytes("a.txt", b"a".to_vec());
        assert!(matches!(
            fs.put("/", &mut s, &no_progress).await.unwrap_err(),
            VfsError::UploadNotSupported
        ));
    }

    #[tokio::test]
    async fn test_streaming_links() {
        let fs = MemoryBackend::new().with_streaming_links(true);
        fs.write_file("/a.txt", "abc").unwrap();
        assert!(!fs.link("/a.txt").await.unwrap().body.is_seekable());
    }
}
