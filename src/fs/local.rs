//! Local filesystem over `tokio::fs`.

use std::io::SeekFrom;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::path::{LocalPath, PathEngine};

use super::{FileMeta, FileType, Fs, FsFile, OpenFlags};

pub struct LocalFs {
    engine: LocalPath,
}

impl LocalFs {
    pub fn new() -> Self {
        LocalFs {
            engine: LocalPath::new(),
        }
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

fn meta_from_std(name: String, md: &std::fs::Metadata) -> FileMeta {
    let ft = md.file_type();
    let file_type = if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_file() {
        FileType::File
    } else {
        FileType::Other
    };

    #[cfg(unix)]
    let (mode, uid, gid, dev, ino) = {
        use std::os::unix::fs::MetadataExt;
        (
            md.mode() & 0o7777,
            Some(md.uid()),
            Some(md.gid()),
            Some(md.dev()),
            Some(md.ino()),
        )
    };
    #[cfg(not(unix))]
    let (mode, uid, gid, dev, ino) = (
        if md.permissions().readonly() { 0o444 } else { 0o666 },
        None,
        None,
        None,
        None,
    );

    FileMeta {
        name,
        size: md.len(),
        mode,
        modified: md.modified().ok(),
        file_type,
        uid,
        gid,
        dev,
        ino,
    }
}

fn base_name(engine: &dyn PathEngine, path: &str) -> String {
    engine.base(path)
}

#[async_trait]
impl Fs for LocalFs {
    fn path_engine(&self) -> &dyn PathEngine {
        &self.engine
    }

    async fn stat(&self, name: &str) -> Result<FileMeta> {
        let md = tokio::fs::metadata(name).await?;
        Ok(meta_from_std(base_name(&self.engine, name), &md))
    }

    async fn lstat(&self, name: &str) -> Result<FileMeta> {
        let md = tokio::fs::symlink_metadata(name).await?;
        Ok(meta_from_std(base_name(&self.engine, name), &md))
    }

    #[cfg(unix)]
    async fn chmod(&self, name: &str, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(name, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn chmod(&self, _name: &str, _mode: u32) -> Result<()> {
        Err(Error::Unsupported("chmod"))
    }

    #[cfg(unix)]
    async fn chown(&self, name: &str, uid: u32, gid: u32) -> Result<()> {
        use nix::unistd::{Gid, Uid};
        nix::unistd::chown(
            std::path::Path::new(name),
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
        )
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    #[cfg(not(unix))]
    async fn chown(&self, _name: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::Unsupported("chown"))
    }

    #[cfg(unix)]
    async fn chtimes(&self, name: &str, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        use nix::sys::time::TimeVal;

        fn timeval(t: SystemTime) -> TimeVal {
            let d = t
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            TimeVal::new(d.as_secs() as _, d.subsec_micros() as _)
        }

        nix::sys::stat::utimes(std::path::Path::new(name), &timeval(atime), &timeval(mtime))
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    #[cfg(not(unix))]
    async fn chtimes(&self, _name: &str, _atime: SystemTime, _mtime: SystemTime) -> Result<()> {
        Err(Error::Unsupported("chtimes"))
    }

    async fn truncate(&self, name: &str, size: u64) -> Result<()> {
        let file = tokio::fs::OpenOptions::new().write(true).open(name).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        tokio::fs::rename(old, new).await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        tokio::fs::symlink(target, link).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(Error::Unsupported("symlink"))
    }

    async fn read_link(&self, name: &str) -> Result<String> {
        let target = tokio::fs::read_link(name).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn is_exist(&self, err: &Error) -> bool {
        matches!(err, Error::AlreadyExists(_))
            || err.io_kind() == Some(std::io::ErrorKind::AlreadyExists)
    }

    fn is_not_exist(&self, err: &Error) -> bool {
        matches!(err, Error::NotFound(_))
            || err.io_kind() == Some(std::io::ErrorKind::NotFound)
    }

    fn is_permission(&self, err: &Error) -> bool {
        matches!(err, Error::PermissionDenied(_))
            || err.io_kind() == Some(std::io::ErrorKind::PermissionDenied)
    }

    async fn getwd(&self) -> Result<String> {
        let wd = std::env::current_dir()?;
        Ok(wd.to_string_lossy().into_owned())
    }

    async fn mkdir(&self, name: &str, mode: u32) -> Result<()> {
        tokio::fs::create_dir(name).await?;
        #[cfg(unix)]
        self.chmod(name, mode).await?;
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    async fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(md) if md.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("mkdir {}: not a directory", path),
                )))
            }
            Err(_) => {}
        }

        // Walk back over the last element and recurse on the parent, so
        // every directory created along the way gets the requested mode.
        let b = path.as_bytes();
        let mut i = path.len();
        while i > 0 && self.engine.is_separator(b[i - 1]) {
            i -= 1;
        }
        let mut j = i;
        while j > 0 && !self.engine.is_separator(b[j - 1]) {
            j -= 1;
        }
        if j > 1 {
            self.mkdir_all(&path[..j - 1], mode).await?;
        }

        match self.mkdir(path, mode).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A racing creator is fine as long as a directory exists now.
                if let Ok(md) = tokio::fs::symlink_metadata(path).await {
                    if md.is_dir() {
                        return Ok(());
                    }
                }
                Err(e)
            }
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let md = tokio::fs::symlink_metadata(name).await?;
        if md.is_dir() {
            tokio::fs::remove_dir(name).await?;
        } else {
            tokio::fs::remove_file(name).await?;
        }
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let md = match tokio::fs::symlink_metadata(path).await {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if md.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
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
        let mut options = tokio::fs::OpenOptions::new();
        let writeish = flags.contains(OpenFlags::WRITE)
            || flags.contains(OpenFlags::APPEND)
            || flags.contains(OpenFlags::TRUNCATE);
        options
            .read(flags.contains(OpenFlags::READ) || !writeish)
            .write(flags.contains(OpenFlags::WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .create_new(flags.contains(OpenFlags::EXCLUSIVE));
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        let file = options.open(name).await?;
        Ok(Box::new(LocalFile {
            file,
            path: name.to_string(),
        }))
    }
}

struct LocalFile {
    file: tokio::fs::File,
    path: String,
}

#[async_trait]
impl FsFile for LocalFile {
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
        let md = self.file.metadata().await?;
        let name = LocalPath::new().base(&self.path);
        Ok(meta_from_std(name, &md))
    }

    #[cfg(unix)]
    async fn chmod(&self, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn chmod(&self, _mode: u32) -> Result<()> {
        Err(Error::Unsupported("chmod"))
    }

    #[cfg(unix)]
    async fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        LocalFs::new().chown(&self.path, uid, gid).await
    }

    #[cfg(not(unix))]
    async fn chown(&self, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::Unsupported("chown"))
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.file.set_len(size).await?;
        Ok(())
    }

    async fn readdir(&self, n: i64) -> Result<Vec<FileMeta>> {
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let md = entry.metadata().await?;
            out.push(meta_from_std(
                entry.file_name().to_string_lossy().into_owned(),
                &md,
            ));
            if n > 0 && out.len() as i64 >= n {
                break;
            }
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}
