//! Working-directory decorator.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::path::PathEngine;

use super::{FileMeta, Fs, FsFile, OpenFlags};

/// Resolves `path` against `wd` through the filesystem's own path engine.
/// Absolute paths pass through untouched.
pub(crate) fn resolve(fs: &dyn Fs, wd: &str, path: &str) -> String {
    let engine = fs.path_engine();
    if engine.is_abs(path) {
        path.to_string()
    } else {
        engine.join(&[wd, path])
    }
}

/// Decorates a filesystem with a base prefix: every relative path argument
/// is joined onto the prefix before hitting the wrapped filesystem.
pub struct WdFs {
    wd: String,
    inner: Arc<dyn Fs>,
}

impl WdFs {
    /// An empty prefix returns the filesystem unchanged.
    pub fn new(prefix: &str, fs: Arc<dyn Fs>) -> Arc<dyn Fs> {
        if prefix.is_empty() {
            return fs;
        }
        Arc::new(WdFs {
            wd: prefix.to_string(),
            inner: fs,
        })
    }

    fn path(&self, name: &str) -> String {
        resolve(&*self.inner, &self.wd, name)
    }
}

#[async_trait]
impl Fs for WdFs {
    fn path_engine(&self) -> &dyn PathEngine {
        self.inner.path_engine()
    }

    async fn stat(&self, name: &str) -> Result<FileMeta> {
        self.inner.stat(&self.path(name)).await
    }

    async fn lstat(&self, name: &str) -> Result<FileMeta> {
        self.inner.lstat(&self.path(name)).await
    }

    async fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        self.inner.chmod(&self.path(name), mode).await
    }

    async fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<()> {
        self.inner.chown(&self.path(name), uid, gid).await
    }

    async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        self.inner.chtimes(&self.path(name), atime, mtime).await
    }

    async fn truncate(&self, name: &str, size: u64) -> Result<()> {
        self.inner.truncate(&self.path(name), size).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.rename(&self.path(old), &self.path(new)).await
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.inner
            .symlink(&self.path(target), &self.path(link))
            .await
    }

    async fn read_link(&self, name: &str) -> Result<String> {
        self.inner.read_link(&self.path(name)).await
    }

    fn same_file(&self, a: &FileMeta, b: &FileMeta) -> bool {
        self.inner.same_file(a, b)
    }

    fn is_exist(&self, err: &Error) -> bool {
        self.inner.is_exist(err)
    }

    fn is_not_exist(&self, err: &Error) -> bool {
        self.inner.is_not_exist(err)
    }

    fn is_permission(&self, err: &Error) -> bool {
        self.inner.is_permission(err)
    }

    async fn getwd(&self) -> Result<String> {
        Ok(self.wd.clone())
    }

    async fn mkdir(&self, name: &str, mode: u32) -> Result<()> {
        self.inner.mkdir(&self.path(name), mode).await
    }

    async fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        self.inner.mkdir_all(&self.path(path), mode).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.inner.remove(&self.path(name)).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        self.inner.remove_all(&self.path(path)).await
    }

    async fn create(&self, name: &str) -> Result<Box<dyn FsFile>> {
        self.inner.create(&self.path(name)).await
    }

    async fn open(&self, name: &str) -> Result<Box<dyn FsFile>> {
        self.inner.open(&self.path(name)).await
    }

    async fn open_file(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn FsFile>> {
        self.inner.open_file(&self.path(name), flags, mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;

    #[tokio::test]
    async fn relative_paths_resolve_against_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap().to_string();
        let fs = WdFs::new(&base, Arc::new(LocalFs::new()));

        let mut f = fs.create("inside.txt").await.unwrap();
        f.write(b"x").await.unwrap();
        f.close().await.unwrap();

        assert!(dir.path().join("inside.txt").exists());
        assert!(fs.stat("inside.txt").await.unwrap().is_file());
        assert_eq!(fs.getwd().await.unwrap(), base);

        fs.mkdir_all("a/b", 0o755).await.unwrap();
        assert!(dir.path().join("a/b").is_dir());
        fs.remove_all("a").await.unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn absolute_paths_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let fs = WdFs::new(dir.path().to_str().unwrap(), Arc::new(LocalFs::new()));

        let abs = other.path().join("out.txt");
        let mut f = fs.create(abs.to_str().unwrap()).await.unwrap();
        f.write(b"y").await.unwrap();
        f.close().await.unwrap();

        assert!(abs.exists());
        assert!(!dir.path().join(abs.file_name().unwrap()).exists());
    }

    #[tokio::test]
    async fn empty_prefix_is_identity() {
        let fs = WdFs::new("", Arc::new(LocalFs::new()));
        let wd = fs.getwd().await.unwrap();
        assert_eq!(wd, std::env::current_dir().unwrap().to_string_lossy());
    }
}
