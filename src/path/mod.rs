//! Path algebra for local and remote filesystems.
//!
//! Remote hosts do not share the local host's path conventions: an SFTP
//! session may be talking to a Windows server from a Unix client or vice
//! versa. [`VirtualPath`] implements the full lexical path contract for a
//! separator/convention chosen at runtime; [`LocalPath`] is the same engine
//! instantiated with the host parameters.

mod virt;

pub use virt::VirtualPath;

use std::sync::Arc;

use crate::error::{Error, Result};

/// Callback used by [`PathEngine::abs`] to resolve relative paths.
pub type Getwd = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Lexical path operations over one path convention.
///
/// All operations are pure string manipulation; nothing here touches a
/// filesystem except `abs`, which consults the engine's working-directory
/// callback.
pub trait PathEngine: Send + Sync {
    /// Path separator byte (`/` or `\`).
    fn separator(&self) -> u8;

    /// Separator between entries of a path list (`:` or `;`).
    fn list_separator(&self) -> u8;

    fn is_separator(&self, c: u8) -> bool;

    /// Shortest lexically-equivalent path: collapses repeated separators,
    /// drops `.` elements and resolves `..` against preceding elements,
    /// bounded by the root or a leading `..` run.
    fn clean(&self, path: &str) -> String;

    fn to_slash(&self, path: &str) -> String;

    fn from_slash(&self, path: &str) -> String;

    /// Splits a list joined with the list separator. Windows convention
    /// respects (and strips) double quotes around entries.
    fn split_list(&self, list: &str) -> Vec<String>;

    /// Splits into (dir, file) immediately after the final separator. The
    /// dir keeps its trailing separator; concatenating the parts restores
    /// the input.
    fn split<'a>(&self, path: &'a str) -> (&'a str, &'a str);

    /// Joins the elements with the separator and cleans the result. Empty
    /// leading elements are skipped; an all-empty input yields `""`.
    fn join(&self, elems: &[&str]) -> String;

    /// File extension including the dot, or `""`.
    fn ext<'a>(&self, path: &'a str) -> &'a str;

    /// Absolute form of `path`, resolving relative input against the
    /// engine's working directory.
    fn abs(&self, path: &str) -> Result<String>;

    /// Relative path such that `join(base, rel) == target` lexically.
    /// Fails with [`Error::CannotRelativise`] when exactly one side is
    /// rooted, when volumes differ, or when base would ascend through `..`.
    fn rel(&self, base: &str, target: &str) -> Result<String>;

    /// Last path element, after stripping trailing separators.
    fn base(&self, path: &str) -> String;

    /// Everything but the last element, cleaned; keeps the volume prefix.
    fn dir(&self, path: &str) -> String;

    /// Leading volume: `C:` or `\\server\share` in Windows convention,
    /// `""` in POSIX convention.
    fn volume_name<'a>(&self, path: &'a str) -> &'a str;

    fn is_abs(&self, path: &str) -> bool;
}

/// The host convention: [`VirtualPath`] parameterised with the compile-time
/// separator and the process working directory.
#[derive(Clone)]
pub struct LocalPath {
    inner: VirtualPath,
}

impl LocalPath {
    pub fn new() -> Self {
        let getwd: Getwd = Arc::new(|| {
            let wd = std::env::current_dir().map_err(Error::Io)?;
            Ok(wd.to_string_lossy().into_owned())
        });
        let (is_unix, sep, list_sep) = if cfg!(windows) {
            (false, b'\\', b';')
        } else {
            (true, b'/', b':')
        };
        LocalPath {
            inner: VirtualPath::new(is_unix, sep, list_sep, getwd),
        }
    }
}

impl Default for LocalPath {
    fn default() -> Self {
        Self::new()
    }
}

impl PathEngine for LocalPath {
    fn separator(&self) -> u8 {
        self.inner.separator()
    }

    fn list_separator(&self) -> u8 {
        self.inner.list_separator()
    }

    fn is_separator(&self, c: u8) -> bool {
        self.inner.is_separator(c)
    }

    fn clean(&self, path: &str) -> String {
        self.inner.clean(path)
    }

    fn to_slash(&self, path: &str) -> String {
        self.inner.to_slash(path)
    }

    fn from_slash(&self, path: &str) -> String {
        self.inner.from_slash(path)
    }

    fn split_list(&self, list: &str) -> Vec<String> {
        self.inner.split_list(list)
    }

    fn split<'a>(&self, path: &'a str) -> (&'a str, &'a str) {
        self.inner.split(path)
    }

    fn join(&self, elems: &[&str]) -> String {
        self.inner.join(elems)
    }

    fn ext<'a>(&self, path: &'a str) -> &'a str {
        self.inner.ext(path)
    }

    // Unlike the virtual Windows engine (which has no host to ask), the
    // local engine can always resolve against the process working directory.
    fn abs(&self, path: &str) -> Result<String> {
        if self.is_abs(path) {
            return Ok(self.clean(path));
        }
        let wd = self.inner.getwd()?;
        Ok(self.join(&[&wd, path]))
    }

    fn rel(&self, base: &str, target: &str) -> Result<String> {
        self.inner.rel(base, target)
    }

    fn base(&self, path: &str) -> String {
        self.inner.base(path)
    }

    fn dir(&self, path: &str) -> String {
        self.inner.dir(path)
    }

    fn volume_name<'a>(&self, path: &'a str) -> &'a str {
        self.inner.volume_name(path)
    }

    fn is_abs(&self, path: &str) -> bool {
        self.inner.is_abs(path)
    }
}
