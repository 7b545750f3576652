//! Remote filesystem over an SFTP subsystem channel.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags as SftpOpenFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::path::{Getwd, LocalPath, PathEngine, VirtualPath};

use super::{FileMeta, FileType, Fs, FsFile, OpenFlags};

/// Directory names are deleted in batches of this size during a recursive
/// remove.
const REMOVE_PAGE: usize = 100;

enum Engine {
    Local(LocalPath),
    Virtual(VirtualPath),
}

impl Engine {
    fn as_dyn(&self) -> &dyn PathEngine {
        match self {
            Engine::Local(e) => e,
            Engine::Virtual(e) => e,
        }
    }
}

/// Filesystem view of one SFTP session.
///
/// Construction probes the server's path convention by statting `/`: a
/// not-found answer implies a Windows server (`\` and `;`), anything else
/// POSIX (`/` and `:`). When the remote convention matches the local host
/// the local path engine is reused; otherwise a virtual engine is built
/// with its working directory bound to the session.
pub struct SftpFs {
    sftp: Arc<SftpSession>,
    engine: Engine,
}

impl SftpFs {
    pub async fn new(sftp: SftpSession) -> Result<Self> {
        let sftp = Arc::new(sftp);

        let windows = match sftp.metadata("/").await {
            Ok(_) => false,
            Err(e) => is_not_exist_raw(&Error::Sftp(e)),
        };
        let (separator, list_separator) = if windows { (b'\\', b';') } else { (b'/', b':') };
        debug!(
            windows = separator == b'\\',
            "probed remote path convention"
        );

        let engine = if separator == std::path::MAIN_SEPARATOR as u8 {
            Engine::Local(LocalPath::new())
        } else {
            let cwd = sftp.canonicalize(".").await.map_err(Error::Sftp)?;
            let getwd: Getwd = Arc::new(move || Ok(cwd.clone()));
            Engine::Virtual(VirtualPath::new(
                separator == b'/',
                separator,
                list_separator,
                getwd,
            ))
        };

        Ok(SftpFs { sftp, engine })
    }

    fn meta_from_attrs(&self, name: String, attrs: &FileAttributes) -> FileMeta {
        let file_type = if attrs.is_dir() {
            FileType::Directory
        } else if attrs.is_symlink() {
            FileType::Symlink
        } else if attrs.is_regular() {
            FileType::File
        } else {
            FileType::Other
        };
        FileMeta {
            name,
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.map(|p| p & 0o7777).unwrap_or(0),
            modified: attrs
                .mtime
                .map(|t| SystemTime::UNIX_EPOCH + Duration::from_secs(t as u64)),
            file_type,
            uid: attrs.uid,
            gid: attrs.gid,
            dev: None,
            ino: None,
        }
    }

    async fn set_attrs(&self, name: &str, attrs: FileAttributes) -> Result<()> {
        self.sftp
            .set_metadata(name, attrs)
            .await
            .map_err(Error::Sftp)
    }

    async fn remove_dir_contents(&self, path: &str) -> Result<()> {
        let entries = match self.sftp.read_dir(path).await {
            Ok(entries) => entries,
            Err(e) => {
                let e = Error::Sftp(e);
                if self.is_not_exist(&e) {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let names: Vec<String> = entries
            .into_iter()
            .map(|entry| entry.file_name())
            .filter(|n| n != "." && n != "..")
            .collect();

        let separator = self.engine.as_dyn().separator() as char;
        let mut first_err: Option<Error> = None;
        for page in names.chunks(REMOVE_PAGE) {
            for name in page {
                let child = format!("{}{}{}", path, separator, name);
                if let Err(e) = self.remove_all(&child).await {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match self.remove(path).await {
            Ok(()) => Ok(()),
            Err(e) if self.is_not_exist(&e) => Ok(()),
            Err(e) => Err(first_err.unwrap_or(e)),
        }
    }
}

fn is_not_exist_raw(err: &Error) -> bool {
    if err.sftp_status() == Some(StatusCode::NoSuchFile) {
        return true;
    }
    matches!(err, Error::NotFound(_))
        || err.io_kind() == Some(std::io::ErrorKind::NotFound)
        || err.to_string().contains("not exist")
}

#[async_trait]
impl Fs for SftpFs {
    fn path_engine(&self) -> &dyn PathEngine {
        self.engine.as_dyn()
    }

    async fn stat(&self, name: &str) -> Result<FileMeta> {
        let attrs = self.sftp.metadata(name).await.map_err(Error::Sftp)?;
        Ok(self.meta_from_attrs(self.engine.as_dyn().base(name), &attrs))
    }

    async fn lstat(&self, name: &str) -> Result<FileMeta> {
        let attrs = self
            .sftp
            .symlink_metadata(name)
            .await
            .map_err(Error::Sftp)?;
        Ok(self.meta_from_attrs(self.engine.as_dyn().base(name), &attrs))
    }

    async fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        self.set_attrs(
            name,
            FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            },
        )
        .await
    }

    async fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<()> {
        self.set_attrs(
            name,
            FileAttributes {
                uid: Some(uid),
                gid: Some(gid),
                ..Default::default()
            },
        )
        .await
    }

    async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        fn secs(t: SystemTime) -> u32 {
            t.duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0)
        }
        self.set_attrs(
            name,
            FileAttributes {
                atime: Some(secs(atime)),
                mtime: Some(secs(mtime)),
                ..Default::default()
            },
        )
        .await
    }

    async fn truncate(&self, name: &str, size: u64) -> Result<()> {
        self.set_attrs(
            name,
            FileAttributes {
                size: Some(size),
                ..Default::default()
            },
        )
        .await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.sftp.rename(old, new).await.map_err(Error::Sftp)
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        self.sftp.symlink(link, target).await.map_err(Error::Sftp)
    }

    async fn read_link(&self, name: &str) -> Result<String> {
        self.sftp.read_link(name).await.map_err(Error::Sftp)
    }

    fn is_exist(&self, err: &Error) -> bool {
        // SFTP v3 has no already-exists status; servers that speak later
        // dialects surface it through the message text.
        matches!(err, Error::AlreadyExists(_))
            || err.io_kind() == Some(std::io::ErrorKind::AlreadyExists)
            || err.to_string().contains("already exist")
    }

    fn is_not_exist(&self, err: &Error) -> bool {
        is_not_exist_raw(err)
    }

    fn is_permission(&self, err: &Error) -> bool {
        err.sftp_status() == Some(StatusCode::PermissionDenied)
            || matches!(err, Error::PermissionDenied(_))
            || err.io_kind() == Some(std::io::ErrorKind::PermissionDenied)
    }

    async fn getwd(&self) -> Result<String> {
        self.sftp.canonicalize(".").await.map_err(Error::Sftp)
    }

    async fn mkdir(&self, name: &str, mode: u32) -> Result<()> {
        // The wire primitive takes no mode.
        self.sftp.create_dir(name).await.map_err(Error::Sftp)?;
        self.chmod(name, mode).await
    }

    async fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        match self.sftp.metadata(path).await {
            Ok(attrs) if attrs.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("mkdir {}: not a directory", path),
                )))
            }
            Err(_) => {}
        }

        // Walk back over the last element and recurse on the parent.
        let b = path.as_bytes();
        let engine = self.engine.as_dyn();
        let mut i = path.len();
        while i > 0 && engine.is_separator(b[i - 1]) {
            i -= 1;
        }
        let mut j = i;
        while j > 0 && !engine.is_separator(b[j - 1]) {
            j -= 1;
        }
        if j > 1 {
            self.mkdir_all(&path[..j - 1], mode).await?;
        }

        match self.mkdir(path, mode).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A racing creator is fine as long as a directory exists now.
                if let Ok(meta) = self.lstat(path).await {
                    if meta.is_dir() {
                        return Ok(());
                    }
                }
                Err(e)
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.sftp.remove_file(name).await {
            Ok(()) => Ok(()),
            Err(file_err) => match self.sftp.remove_dir(name).await {
                Ok(()) => Ok(()),
                Err(_) => Err(Error::Sftp(file_err)),
            },
        }
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let err = match self.remove(path).await {
            Ok(()) => return Ok(()),
            Err(e) if self.is_not_exist(&e) => return Ok(()),
            Err(e) => e,
        };

        let meta = match self.lstat(path).await {
            Ok(meta) => meta,
            Err(e) if self.is_not_exist(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !meta.is_dir() {
            return Err(err);
        }
        self.remove_dir_contents(path).await
    }

    async fn create(&self, name: &str) -> Result<Box<dyn FsFile>> {
        self.open_file(
            name,
            OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE | OpenFlags::TRUNCATE,
            0o644,
        )
        .await
    }

    async fn open(&self, name: &str) -> Result<Box<dyn FsFile>> {
        self.open_file(name, OpenFlags::READ, 0).await
    }

    async fn open_file(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn FsFile>> {
        // The open call takes no mode, so the requested one is applied
        // afterwards, and only when this call actually created the file.
        let mut chmod = false;
        if flags.contains(OpenFlags::CREATE) {
            match self.sftp.metadata(name).await {
                Ok(_) => {}
                Err(e) => chmod = self.is_not_exist(&Error::Sftp(e)),
            }
        }

        let mut wire = SftpOpenFlags::empty();
        let writeish = flags.contains(OpenFlags::WRITE)
            || flags.contains(OpenFlags::APPEND)
            || flags.contains(OpenFlags::TRUNCATE);
        if flags.contains(OpenFlags::READ) || !writeish {
            wire |= SftpOpenFlags::READ;
        }
        if flags.contains(OpenFlags::WRITE) {
            wire |= SftpOpenFlags::WRITE;
        }
        if flags.contains(OpenFlags::APPEND) {
            wire |= SftpOpenFlags::APPEND;
        }
        if flags.contains(OpenFlags::CREATE) {
            wire |= SftpOpenFlags::CREATE;
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            wire |= SftpOpenFlags::TRUNCATE;
        }
        if flags.contains(OpenFlags::EXCLUSIVE) {
            wire |= SftpOpenFlags::EXCLUDE;
        }

        let file = self
            .sftp
            .open_with_flags(name, wire)
            .await
            .map_err(Error::Sftp)?;

        if chmod {
            self.chmod(name, mode).await?;
        }

        Ok(Box::new(SftpFile {
            file,
            path: name.to_string(),
            sftp: self.sftp.clone(),
            base: self.engine.as_dyn().base(name),
        }))
    }
}

struct SftpFile {
    file: russh_sftp::client::fs::File,
    path: String,
    sftp: Arc<SftpSession>,
    base: String,
}

impl SftpFile {
    fn meta_from_attrs(&self, name: String, attrs: &FileAttributes) -> FileMeta {
        let file_type = if attrs.is_dir() {
            FileType::Directory
        } else if attrs.is_symlink() {
            FileType::Symlink
        } else if attrs.is_regular() {
            FileType::File
        } else {
            FileType::Other
        };
        FileMeta {
            name,
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.map(|p| p & 0o7777).unwrap_or(0),
            modified: attrs
                .mtime
                .map(|t| SystemTime::UNIX_EPOCH + Duration::from_secs(t as u64)),
            file_type,
            uid: attrs.uid,
            gid: attrs.gid,
            dev: None,
            ino: None,
        }
    }
}

#[async_trait]
impl FsFile for SftpFile {
    fn name(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf).await?)
    }

    async fn write_str(&mut self, s: &str) -> Result<usize> {
        self.write(s.as_bytes()).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos).await?)
    }

    async fn stat(&self) -> Result<FileMeta> {
        let attrs = self
            .sftp
            .metadata(&self.path)
            .await
            .map_err(Error::Sftp)?;
        Ok(self.meta_from_attrs(self.base.clone(), &attrs))
    }

    async fn chmod(&self, mode: u32) -> Result<()> {
        self.sftp
            .set_metadata(
                &self.path,
                FileAttributes {
                    permissions: Some(mode),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::Sftp)
    }

    async fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        self.sftp
            .set_metadata(
                &self.path,
                FileAttributes {
                    uid: Some(uid),
                    gid: Some(gid),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::Sftp)
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.sftp
            .set_metadata(
                &self.path,
                FileAttributes {
                    size: Some(size),
                    ..Default::default()
                },
            )
            .await
            .map_err(Error::Sftp)
    }

    async fn readdir(&self, n: i64) -> Result<Vec<FileMeta>> {
        let entries = self
            .sftp
            .read_dir(&self.path)
            .await
            .map_err(Error::Sftp)?;
        let mut out = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let attrs = entry.metadata();
            out.push(self.meta_from_attrs(name, &attrs));
            if n > 0 && out.len() as i64 >= n {
                break;
            }
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.shutdown().await?;
        Ok(())
    }
}
