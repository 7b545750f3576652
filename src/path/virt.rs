use crate::error::{Error, Result};

use super::{Getwd, PathEngine};

/// Lexical path engine for a convention chosen at runtime.
///
/// POSIX mode compares path elements byte-for-byte; Windows mode compares
/// case-insensitively and additionally recognises drive-letter (`C:`) and
/// UNC (`\\server\share`) volume prefixes.
#[derive(Clone)]
pub struct VirtualPath {
    is_unix: bool,
    separator: u8,
    list_separator: u8,
    getwd: Getwd,
}

impl VirtualPath {
    pub fn new(is_unix: bool, separator: u8, list_separator: u8, getwd: Getwd) -> Self {
        VirtualPath {
            is_unix,
            separator,
            list_separator,
            getwd,
        }
    }

    /// POSIX convention: `/` and `:`.
    pub fn posix(getwd: Getwd) -> Self {
        VirtualPath::new(true, b'/', b':', getwd)
    }

    /// Windows convention: `\` and `;`.
    pub fn windows(getwd: Getwd) -> Self {
        VirtualPath::new(false, b'\\', b';', getwd)
    }

    pub(crate) fn getwd(&self) -> Result<String> {
        (self.getwd)()
    }

    fn sep_str(&self) -> String {
        (self.separator as char).to_string()
    }

    fn volume_name_len(&self, path: &str) -> usize {
        if self.is_unix {
            0
        } else {
            windows_volume_name_len(path)
        }
    }

    fn same_word(&self, a: &str, b: &str) -> bool {
        if self.is_unix {
            a == b
        } else {
            a.eq_ignore_ascii_case(b)
        }
    }

    fn unix_join(&self, elems: &[&str]) -> String {
        for (i, e) in elems.iter().enumerate() {
            if !e.is_empty() {
                return self.clean(&elems[i..].join(&self.sep_str()));
            }
        }
        String::new()
    }

    fn windows_join(&self, elems: &[&str]) -> String {
        for (i, e) in elems.iter().enumerate() {
            if !e.is_empty() {
                return self.windows_join_non_empty(&elems[i..]);
            }
        }
        String::new()
    }

    // Assumes the first element is non-empty.
    fn windows_join_non_empty(&self, elems: &[&str]) -> String {
        if elems[0].len() == 2 && elems[0].as_bytes()[1] == b':' {
            // Bare drive letter: keep the tail relative to the current
            // directory on that drive.
            return self.clean(&format!("{}{}", elems[0], elems[1..].join(&self.sep_str())));
        }
        // Joining two non-UNC paths must not fabricate a UNC path.
        let joined = self.clean(&elems.join(&self.sep_str()));
        if !self.windows_is_unc(&joined) {
            return joined;
        }
        let head = self.clean(elems[0]);
        if self.windows_is_unc(&head) {
            return joined;
        }
        let tail = self.clean(&elems[1..].join(&self.sep_str()));
        if head.as_bytes()[head.len() - 1] == self.separator {
            format!("{}{}", head, tail)
        } else {
            format!("{}{}{}", head, self.separator as char, tail)
        }
    }

    fn windows_is_unc(&self, path: &str) -> bool {
        windows_volume_name_len(path) > 2
    }

    fn unix_is_abs(&self, path: &str) -> bool {
        path.starts_with('/')
    }

    fn windows_is_abs(&self, path: &str) -> bool {
        let l = windows_volume_name_len(path);
        if l == 0 {
            return false;
        }
        let rest = &path.as_bytes()[l..];
        if rest.is_empty() {
            return false;
        }
        windows_is_slash(rest[0])
    }

    fn unix_split_list(&self, list: &str) -> Vec<String> {
        if list.is_empty() {
            return Vec::new();
        }
        list.split(self.list_separator as char)
            .map(str::to_string)
            .collect()
    }

    fn windows_split_list(&self, list: &str) -> Vec<String> {
        if list.is_empty() {
            return Vec::new();
        }

        // Split on the list separator, respecting double quotes.
        let b = list.as_bytes();
        let mut out = Vec::new();
        let mut start = 0usize;
        let mut quoted = false;
        for (i, &c) in b.iter().enumerate() {
            if c == b'"' {
                quoted = !quoted;
            } else if c == self.list_separator && !quoted {
                out.push(list[start..i].to_string());
                start = i + 1;
            }
        }
        out.push(list[start..].to_string());

        for entry in &mut out {
            if entry.contains('"') {
                *entry = entry.replace('"', "");
            }
        }
        out
    }
}

impl PathEngine for VirtualPath {
    fn separator(&self) -> u8 {
        self.separator
    }

    fn list_separator(&self) -> u8 {
        self.list_separator
    }

    fn is_separator(&self, c: u8) -> bool {
        self.separator == c
    }

    fn clean(&self, path: &str) -> String {
        let original = path;
        let vol_len = self.volume_name_len(path);
        let rest = &original.as_bytes()[vol_len..];
        if rest.is_empty() {
            if vol_len > 1 && original.as_bytes()[1] != b':' {
                // UNC volume with nothing after it.
                return self.from_slash(original);
            }
            return format!("{}.", original);
        }
        let rooted = self.is_separator(rest[0]);

        // Reading from rest at r, writing through the lazy buffer at w.
        // dotdot marks the position in the output that `..` must not back
        // over: the rooted slash, or the end of a leading `..` run.
        let n = rest.len();
        let mut out = LazyBuf::new(rest, original, vol_len);
        let (mut r, mut dotdot) = (0usize, 0usize);
        if rooted {
            out.append(self.separator);
            r = 1;
            dotdot = 1;
        }

        while r < n {
            if self.is_separator(rest[r]) {
                // Empty path element.
                r += 1;
            } else if rest[r] == b'.' && (r + 1 == n || self.is_separator(rest[r + 1])) {
                // `.` element.
                r += 1;
            } else if rest[r] == b'.'
                && rest[r + 1] == b'.'
                && (r + 2 == n || self.is_separator(rest[r + 2]))
            {
                // `..` element: back up to the previous separator.
                r += 2;
                if out.w > dotdot {
                    out.w -= 1;
                    while out.w > dotdot && !self.is_separator(out.index(out.w)) {
                        out.w -= 1;
                    }
                } else if !rooted {
                    // Cannot back up further; keep the `..`.
                    if out.w > 0 {
                        out.append(self.separator);
                    }
                    out.append(b'.');
                    out.append(b'.');
                    dotdot = out.w;
                }
            } else {
                // Real element.
                if (rooted && out.w != 1) || (!rooted && out.w != 0) {
                    out.append(self.separator);
                }
                while r < n && !self.is_separator(rest[r]) {
                    out.append(rest[r]);
                    r += 1;
                }
            }
        }

        if out.w == 0 {
            out.append(b'.');
        }

        self.from_slash(&out.string())
    }

    fn to_slash(&self, path: &str) -> String {
        if self.separator == b'/' {
            return path.to_string();
        }
        path.replace(self.separator as char, "/")
    }

    fn from_slash(&self, path: &str) -> String {
        if self.separator == b'/' {
            return path.to_string();
        }
        path.replace('/', &self.sep_str())
    }

    fn split_list(&self, list: &str) -> Vec<String> {
        if self.is_unix {
            self.unix_split_list(list)
        } else {
            self.windows_split_list(list)
        }
    }

    fn split<'a>(&self, path: &'a str) -> (&'a str, &'a str) {
        let vol_len = self.volume_name_len(path);
        let b = path.as_bytes();
        let mut i = path.len() as isize - 1;
        while i >= vol_len as isize && !self.is_separator(b[i as usize]) {
            i -= 1;
        }
        let cut = (i + 1) as usize;
        (&path[..cut], &path[cut..])
    }

    fn join(&self, elems: &[&str]) -> String {
        if self.is_unix {
            self.unix_join(elems)
        } else {
            self.windows_join(elems)
        }
    }

    fn ext<'a>(&self, path: &'a str) -> &'a str {
        let b = path.as_bytes();
        let mut i = path.len() as isize - 1;
        while i >= 0 && !self.is_separator(b[i as usize]) {
            if b[i as usize] == b'.' {
                return &path[i as usize..];
            }
            i -= 1;
        }
        ""
    }

    fn abs(&self, path: &str) -> Result<String> {
        if self.is_unix {
            if self.unix_is_abs(path) {
                return Ok(self.clean(path));
            }
            let wd = self.getwd()?;
            Ok(self.unix_join(&[&wd, path]))
        } else {
            // Resolving a relative Windows path needs host support the
            // remote side cannot provide; hand the input back.
            Ok(path.to_string())
        }
    }

    fn rel(&self, base: &str, target: &str) -> Result<String> {
        let cannot = || Error::CannotRelativise {
            base: base.to_string(),
            target: target.to_string(),
        };

        let base_vol = self.volume_name(base).to_string();
        let targ_vol = self.volume_name(target).to_string();
        let base_clean = self.clean(base);
        let targ_clean = self.clean(target);
        if self.same_word(&targ_clean, &base_clean) {
            return Ok(".".to_string());
        }
        let mut base_rest = base_clean[base_vol.len()..].to_string();
        let targ_rest = targ_clean[targ_vol.len()..].to_string();
        if base_rest == "." {
            base_rest = String::new();
        }
        // `is_abs` cannot be used here: `\a` and `a` are both relative in
        // Windows convention, yet only one is rooted.
        let base_slashed = !base_rest.is_empty() && base_rest.as_bytes()[0] == self.separator;
        let targ_slashed = !targ_rest.is_empty() && targ_rest.as_bytes()[0] == self.separator;
        if base_slashed != targ_slashed || !self.same_word(&base_vol, &targ_vol) {
            return Err(cannot());
        }

        // Walk both paths to the first differing element.
        let bb = base_rest.as_bytes();
        let tb = targ_rest.as_bytes();
        let (bl, tl) = (bb.len(), tb.len());
        let (mut b0, mut bi, mut t0, mut ti) = (0usize, 0usize, 0usize, 0usize);
        loop {
            while bi < bl && bb[bi] != self.separator {
                bi += 1;
            }
            while ti < tl && tb[ti] != self.separator {
                ti += 1;
            }
            if !self.same_word(&targ_rest[t0..ti], &base_rest[b0..bi]) {
                break;
            }
            if bi < bl {
                bi += 1;
            }
            if ti < tl {
                ti += 1;
            }
            b0 = bi;
            t0 = ti;
        }
        if &base_rest[b0..bi] == ".." {
            return Err(cannot());
        }
        if b0 != bl {
            // Base elements remain: go up before going down.
            let seps = base_rest[b0..bl]
                .bytes()
                .filter(|&c| c == self.separator)
                .count();
            let mut buf = String::from("..");
            for _ in 0..seps {
                buf.push(self.separator as char);
                buf.push_str("..");
            }
            if t0 != tl {
                buf.push(self.separator as char);
                buf.push_str(&targ_rest[t0..]);
            }
            return Ok(buf);
        }
        Ok(targ_rest[t0..].to_string())
    }

    fn base(&self, path: &str) -> String {
        if path.is_empty() {
            return ".".to_string();
        }
        // Strip trailing separators.
        let mut p = path;
        while !p.is_empty() && self.is_separator(p.as_bytes()[p.len() - 1]) {
            p = &p[..p.len() - 1];
        }
        // Throw away the volume.
        p = &p[self.volume_name_len(p)..];
        // Find the last element.
        let b = p.as_bytes();
        let mut i = p.len() as isize - 1;
        while i >= 0 && !self.is_separator(b[i as usize]) {
            i -= 1;
        }
        if i >= 0 {
            p = &p[(i + 1) as usize..];
        }
        if p.is_empty() {
            // The input was all separators.
            return self.sep_str();
        }
        p.to_string()
    }

    fn dir(&self, path: &str) -> String {
        let vol = self.volume_name(path);
        let b = path.as_bytes();
        let mut i = path.len() as isize - 1;
        while i >= vol.len() as isize && !self.is_separator(b[i as usize]) {
            i -= 1;
        }
        let dir = self.clean(&path[vol.len()..(i + 1) as usize]);
        format!("{}{}", vol, dir)
    }

    fn volume_name<'a>(&self, path: &'a str) -> &'a str {
        &path[..self.volume_name_len(path)]
    }

    fn is_abs(&self, path: &str) -> bool {
        if self.is_unix {
            self.unix_is_abs(path)
        } else {
            self.windows_is_abs(path)
        }
    }
}

/// Copy-on-write output buffer for `clean`: as long as the output tracks a
/// prefix of the input byte-for-byte, nothing is allocated and unchanged
/// inputs are returned as-is.
struct LazyBuf<'a> {
    path: &'a [u8],
    buf: Option<Vec<u8>>,
    w: usize,
    vol_and_path: &'a str,
    vol_len: usize,
}

impl<'a> LazyBuf<'a> {
    fn new(path: &'a [u8], vol_and_path: &'a str, vol_len: usize) -> Self {
        LazyBuf {
            path,
            buf: None,
            w: 0,
            vol_and_path,
            vol_len,
        }
    }

    fn index(&self, i: usize) -> u8 {
        match &self.buf {
            Some(b) => b[i],
            None => self.path[i],
        }
    }

    fn append(&mut self, c: u8) {
        if self.buf.is_none() {
            if self.w < self.path.len() && self.path[self.w] == c {
                self.w += 1;
                return;
            }
            let mut b = vec![0u8; self.path.len()];
            b[..self.w].copy_from_slice(&self.path[..self.w]);
            self.buf = Some(b);
        }
        if let Some(b) = self.buf.as_mut() {
            b[self.w] = c;
            self.w += 1;
        }
    }

    fn string(&self) -> String {
        match &self.buf {
            None => self.vol_and_path[..self.vol_len + self.w].to_string(),
            Some(b) => format!(
                "{}{}",
                &self.vol_and_path[..self.vol_len],
                String::from_utf8_lossy(&b[..self.w])
            ),
        }
    }
}

fn windows_is_slash(c: u8) -> bool {
    c == b'\\' || c == b'/'
}

fn windows_volume_name_len(path: &str) -> usize {
    let b = path.as_bytes();
    if b.len() < 2 {
        return 0;
    }
    // Drive letter.
    if b[1] == b':' && b[0].is_ascii_alphabetic() {
        return 2;
    }
    // UNC: leading `\\`, a server name, one separator, a share name.
    let l = b.len();
    if l >= 5 && windows_is_slash(b[0]) && windows_is_slash(b[1]) && !windows_is_slash(b[2]) && b[2] != b'.'
    {
        let mut n = 3;
        while n < l - 1 {
            if windows_is_slash(b[n]) {
                n += 1;
                if !windows_is_slash(b[n]) {
                    if b[n] == b'.' {
                        break;
                    }
                    while n < l {
                        if windows_is_slash(b[n]) {
                            break;
                        }
                        n += 1;
                    }
                    return n;
                }
                break;
            }
            n += 1;
        }
    }
    0
}
