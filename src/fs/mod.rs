//! Uniform filesystem contract over the local OS and remote SFTP.
//!
//! [`Agent`](crate::Agent) operations never talk to `tokio::fs` or the SFTP
//! client directly; they go through [`Fs`], so a file copy between any two
//! sides (local→remote, remote→local, local→local) is one algorithm. Each
//! filesystem carries its own [`PathEngine`] because the remote convention
//! is only known after probing the server.

mod local;
mod sftp;
mod wd;

pub use local::LocalFs;
pub use sftp::SftpFs;
pub use wd::WdFs;

pub(crate) use wd::resolve;

use std::io::SeekFrom;
use std::ops::BitOr;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::path::PathEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Other,
}

/// Filesystem-neutral metadata.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    /// Permission bits (`0o777`-style).
    pub mode: u32,
    pub modified: Option<SystemTime>,
    pub file_type: FileType,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Device/inode identity where the backing filesystem exposes one;
    /// feeds [`Fs::same_file`].
    pub(crate) dev: Option<u64>,
    pub(crate) ino: Option<u64>,
}

impl FileMeta {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Open-mode flags for [`Fs::open_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(1 << 0);
    pub const WRITE: OpenFlags = OpenFlags(1 << 1);
    pub const APPEND: OpenFlags = OpenFlags(1 << 2);
    pub const CREATE: OpenFlags = OpenFlags(1 << 3);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 4);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(1 << 5);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// One filesystem view: the local OS, a remote SFTP mount, or a decorated
/// variant of either.
#[async_trait]
pub trait Fs: Send + Sync {
    /// The path convention this filesystem speaks.
    fn path_engine(&self) -> &dyn PathEngine;

    async fn stat(&self, name: &str) -> Result<FileMeta>;
    async fn lstat(&self, name: &str) -> Result<FileMeta>;

    async fn chmod(&self, name: &str, mode: u32) -> Result<()>;
    async fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<()>;
    async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> Result<()>;
    async fn truncate(&self, name: &str, size: u64) -> Result<()>;

    async fn rename(&self, old: &str, new: &str) -> Result<()>;
    async fn symlink(&self, target: &str, link: &str) -> Result<()>;
    async fn read_link(&self, name: &str) -> Result<String>;

    /// Whether two metadata records describe the same underlying file.
    fn same_file(&self, a: &FileMeta, b: &FileMeta) -> bool {
        match (a.dev, a.ino, b.dev, b.ino) {
            (Some(ad), Some(ai), Some(bd), Some(bi)) => ad == bd && ai == bi,
            _ => false,
        }
    }

    /// Classifies an error this filesystem returned as "already exists".
    fn is_exist(&self, err: &Error) -> bool;

    /// Classifies an error this filesystem returned as "does not exist".
    fn is_not_exist(&self, err: &Error) -> bool;

    /// Classifies an error this filesystem returned as a permission denial.
    fn is_permission(&self, err: &Error) -> bool;

    async fn getwd(&self) -> Result<String>;

    async fn mkdir(&self, name: &str, mode: u32) -> Result<()>;
    async fn mkdir_all(&self, path: &str, mode: u32) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// `O_CREATE|O_RDWR|O_TRUNC` with mode 0644.
    async fn create(&self, name: &str) -> Result<Box<dyn FsFile>>;

    /// Read-only open.
    async fn open(&self, name: &str) -> Result<Box<dyn FsFile>>;

    async fn open_file(&self, name: &str, flags: OpenFlags, mode: u32)
        -> Result<Box<dyn FsFile>>;
}

/// An open file handle on either side.
#[async_trait]
pub trait FsFile: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;
    async fn write_str(&mut self, s: &str) -> Result<usize>;
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    async fn stat(&self) -> Result<FileMeta>;
    async fn chmod(&self, mode: u32) -> Result<()>;
    async fn chown(&self, uid: u32, gid: u32) -> Result<()>;
    async fn truncate(&self, size: u64) -> Result<()>;

    /// Directory entries of the path this handle was opened on. `n > 0`
    /// returns at most `n` entries; otherwise all of them.
    async fn readdir(&self, n: i64) -> Result<Vec<FileMeta>>;

    async fn readdir_names(&self, n: i64) -> Result<Vec<String>> {
        let entries = self.readdir(n).await?;
        Ok(entries.into_iter().map(|m| m.name).collect())
    }

    async fn close(&mut self) -> Result<()>;
}
