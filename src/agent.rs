//! One SSH/SFTP connection and the operations that run over it.
//!
//! An [`Agent`] pairs a transport with two filesystem views (the remote
//! host over SFTP and the local host) and exposes the same vocabulary over
//! both: `r*` methods address the remote side, `l*` methods the local one.
//! Handles are reference-counted: [`Agent::nop_close`] hands out sibling
//! handles whose `close` only decrements the shared counter, which is what
//! lets the [`Mux`](crate::Mux) cache one live connection among many
//! concurrent consumers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::auth::Auth;
use crate::error::{Error, Result};
use crate::fs::{resolve, FileMeta, Fs, FsFile, LocalFs, OpenFlags, SftpFs};
use crate::session::{SessionPool, SessionTicket};
use crate::transport::{run_command, Transport, TunnelStream};

/// Upper bound for the streaming buffer of a file transfer.
pub const COPY_BUFFER_SIZE: u64 = 1024 * 1024;

/// Separator between the `cd`, `export` and command fragments.
pub const CMD_SEPARATOR: &str = "&&";

struct Shared {
    transport: Option<Transport>,
    remote_fs: Arc<dyn Fs>,
    local_fs: Arc<dyn Fs>,
    pool: SessionPool,
    /// Non-owning handle to the connection this one was dialed through.
    gate: Option<Agent>,
    opened_at: Instant,
    opened_wall: DateTime<Utc>,
    refs: AtomicI32,
    closed: AtomicBool,
}

/// A handle to one logical connection.
///
/// The working directories live on the handle; everything else is shared.
/// Owning handles tear the connection down on `close`; non-owning handles
/// (from [`nop_close`](Agent::nop_close)) only decrement the counter.
pub struct Agent {
    shared: Arc<Shared>,
    nop_close: bool,
    rcwd: String,
    lcwd: String,
}

impl Agent {
    /// Dials `addr` directly.
    pub async fn dial(addr: &str, auth: &Auth) -> Result<Agent> {
        let cfg = auth.transport_config()?;
        let transport = Transport::connect(addr, &cfg).await?;
        Agent::assemble(transport, auth.max_session, None).await
    }

    /// Dials `addr` through this connection: a TCP channel is opened over
    /// this transport and the SSH handshake runs on top of it. The new
    /// agent holds a non-owning handle to this one and releases it on
    /// close.
    pub async fn dial_via(&self, addr: &str, auth: &Auth) -> Result<Agent> {
        let cfg = auth.transport_config()?;
        let transport = {
            let gate = self.shared.transport.as_ref().ok_or(Error::ConnClosed)?;
            Transport::connect_via(gate, addr, &cfg).await?
        };
        Agent::assemble(transport, auth.max_session, Some(self.nop_close())).await
    }

    /// An agent with no transport at all: the "remote" side is the local
    /// filesystem and remote commands run under the local shell.
    pub fn local_only() -> Result<Agent> {
        let local_fs: Arc<dyn Fs> = Arc::new(LocalFs::new());
        let wd = std::env::current_dir()?.to_string_lossy().into_owned();
        if !local_fs.path_engine().is_abs(&wd) {
            return Err(Error::PathNotAbsolute(wd));
        }
        Ok(Agent {
            shared: Arc::new(Shared {
                transport: None,
                remote_fs: local_fs.clone(),
                local_fs,
                pool: SessionPool::new(0),
                gate: None,
                opened_at: Instant::now(),
                opened_wall: Utc::now(),
                refs: AtomicI32::new(0),
                closed: AtomicBool::new(false),
            }),
            nop_close: false,
            rcwd: wd.clone(),
            lcwd: wd,
        })
    }

    async fn assemble(
        transport: Transport,
        max_session: i32,
        gate: Option<Agent>,
    ) -> Result<Agent> {
        let prepared: Result<(Arc<dyn Fs>, Arc<dyn Fs>, String, String)> = async {
            let sftp = transport.sftp().await?;
            let remote_fs: Arc<dyn Fs> = Arc::new(SftpFs::new(sftp).await?);
            let local_fs: Arc<dyn Fs> = Arc::new(LocalFs::new());
            let rcwd = remote_fs.getwd().await?;
            if !remote_fs.path_engine().is_abs(&rcwd) {
                return Err(Error::PathNotAbsolute(rcwd));
            }
            let lcwd = local_fs.getwd().await?;
            if !local_fs.path_engine().is_abs(&lcwd) {
                return Err(Error::PathNotAbsolute(lcwd));
            }
            Ok((remote_fs, local_fs, rcwd, lcwd))
        }
        .await;

        match prepared {
            Ok((remote_fs, local_fs, rcwd, lcwd)) => {
                info!(addr = %transport.addr(), "agent ready");
                Ok(Agent {
                    shared: Arc::new(Shared {
                        transport: Some(transport),
                        remote_fs,
                        local_fs,
                        pool: SessionPool::new(max_session),
                        gate,
                        opened_at: Instant::now(),
                        opened_wall: Utc::now(),
                        refs: AtomicI32::new(0),
                        closed: AtomicBool::new(false),
                    }),
                    nop_close: false,
                    rcwd,
                    lcwd,
                })
            }
            Err(e) => {
                transport.disconnect().await;
                if let Some(gate) = gate {
                    gate.close().await;
                }
                Err(e)
            }
        }
    }

    fn shallow(&self) -> Agent {
        Agent {
            shared: self.shared.clone(),
            nop_close: self.nop_close,
            rcwd: self.rcwd.clone(),
            lcwd: self.lcwd.clone(),
        }
    }

    /// A sibling handle whose `close` only decrements the shared reference
    /// counter. The counter is incremented immediately.
    pub fn nop_close(&self) -> Agent {
        self.shared.refs.fetch_add(1, Ordering::SeqCst);
        let mut handle = self.shallow();
        handle.nop_close = true;
        handle
    }

    /// Closes this handle. For non-owning handles this only decrements the
    /// counter; for the owning handle it closes the session pool and the
    /// transport, and releases the gate reference if this connection was
    /// dialed through one. Idempotent.
    pub async fn close(&self) {
        if self.nop_close {
            self.shared.refs.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(gate) = &self.shared.gate {
            gate.shared.refs.fetch_sub(1, Ordering::SeqCst);
        }
        self.shared.pool.close();
        if let Some(transport) = &self.shared.transport {
            transport.disconnect().await;
            info!(addr = %transport.addr(), "agent closed");
        }
    }

    /// Open timestamp and current reference count.
    pub fn status(&self) -> (DateTime<Utc>, i32) {
        (
            self.shared.opened_wall,
            self.shared.refs.load(Ordering::SeqCst),
        )
    }

    pub(crate) fn refs(&self) -> i32 {
        self.shared.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn opened_at(&self) -> Instant {
        self.shared.opened_at
    }

    pub fn local_fs(&self) -> Arc<dyn Fs> {
        self.shared.local_fs.clone()
    }

    pub fn remote_fs(&self) -> Arc<dyn Fs> {
        self.shared.remote_fs.clone()
    }

    /// Opens a raw tunnelled socket to `host:port` through this
    /// connection.
    pub async fn dial_conn(&self, host: &str, port: u32) -> Result<TunnelStream> {
        let transport = self.shared.transport.as_ref().ok_or(Error::ConnClosed)?;
        Ok(transport.open_direct_tcpip(host, port).await?.into_stream())
    }

    // ---- working directories ----

    fn rpath(&self, path: &str) -> String {
        resolve(&*self.shared.remote_fs, &self.rcwd, path)
    }

    fn lpath(&self, path: &str) -> String {
        resolve(&*self.shared.local_fs, &self.lcwd, path)
    }

    /// Changes the base for relative remote paths.
    pub fn rcd(&mut self, cwd: &str) {
        self.rcwd = self.rpath(cwd);
    }

    /// Changes the base for relative local paths.
    pub fn lcd(&mut self, cwd: &str) {
        self.lcwd = self.lpath(cwd);
    }

    /// A shallow copy with its own remote working directory. The copy
    /// shares the refcount, pool and transports; discard it without
    /// calling `close`.
    pub fn tmp_rcd(&self, cwd: &str) -> Agent {
        let mut copy = self.shallow();
        copy.rcd(cwd);
        copy
    }

    /// Like [`tmp_rcd`](Agent::tmp_rcd) for the local side.
    pub fn tmp_lcd(&self, cwd: &str) -> Agent {
        let mut copy = self.shallow();
        copy.lcd(cwd);
        copy
    }

    pub fn rcwd(&self) -> &str {
        &self.rcwd
    }

    pub fn lcwd(&self) -> &str {
        &self.lcwd
    }

    // ---- commands ----

    /// Runs `cmd` on the remote host under `cd <rcwd> && export <env> &&`,
    /// returning combined stdout/stderr. Takes a ticket from the session
    /// pool; a server that answers "administratively prohibited" costs the
    /// pool one slot and the call retries on a fresh ticket.
    pub async fn rcmd(&self, cmd: &str, env: &[&str]) -> Result<Vec<u8>> {
        let transport = self.shared.transport.as_ref().ok_or(Error::ConnClosed)?;
        let command = compose_command(&self.rcwd, env, cmd);
        debug!(command = %command, "rcmd");

        let (ticket, mut channel) =
            take_session(&self.shared.pool, || transport.open_session()).await?;
        let result = run_command(&mut channel, &command).await;
        ticket.release();
        result
    }

    /// Runs `cmd` under the local shell (`sh -c`) with the same composed
    /// form as [`rcmd`](Agent::rcmd). Env pairs are also placed in the
    /// child environment.
    pub async fn lcmd(&self, cmd: &str, env: &[&str]) -> Result<Vec<u8>> {
        let command = compose_command(&self.lcwd, env, cmd);
        debug!(command = %command, "lcmd");

        let mut child = tokio::process::Command::new("sh");
        child.arg("-c").arg(&command);
        for pair in env {
            if let Some((key, value)) = pair.split_once('=') {
                child.env(key, value);
            }
        }
        let out = child.output().await?;
        let mut combined = out.stdout;
        combined.extend_from_slice(&out.stderr);
        if !out.status.success() {
            return Err(Error::CommandFailed {
                status: out.status.code().unwrap_or(1) as u32,
                output: combined,
            });
        }
        Ok(combined)
    }

    /// Detached remote command: `nohup <cmd> >stdout 2>stderr </dev/null &`.
    /// Empty `stdout` defaults to `nohup.out`; empty `stderr` (or one equal
    /// to `stdout`) merges into it.
    pub async fn rcmd_bg(
        &self,
        cmd: &str,
        stdout: &str,
        stderr: &str,
        env: &[&str],
    ) -> Result<Vec<u8>> {
        self.rcmd(&background_command(cmd, stdout, stderr), env)
            .await
    }

    /// Detached local command; see [`rcmd_bg`](Agent::rcmd_bg).
    pub async fn lcmd_bg(
        &self,
        cmd: &str,
        stdout: &str,
        stderr: &str,
        env: &[&str],
    ) -> Result<Vec<u8>> {
        self.lcmd(&background_command(cmd, stdout, stderr), env)
            .await
    }

    // ---- file operations ----

    pub async fn rread_file(&self, path: &str) -> Result<Vec<u8>> {
        read_file(&*self.shared.remote_fs, &self.rpath(path)).await
    }

    pub async fn lread_file(&self, path: &str) -> Result<Vec<u8>> {
        read_file(&*self.shared.local_fs, &self.lpath(path)).await
    }

    pub async fn rwrite_file(&self, path: &str, data: &[u8]) -> Result<()> {
        write_file(&*self.shared.remote_fs, &self.rpath(path), data).await
    }

    pub async fn lwrite_file(&self, path: &str, data: &[u8]) -> Result<()> {
        write_file(&*self.shared.local_fs, &self.lpath(path), data).await
    }

    /// Directory entries sorted by name. `n > 0` caps the count.
    pub async fn rreaddir(&self, path: &str, n: i64) -> Result<Vec<FileMeta>> {
        readdir(&*self.shared.remote_fs, &self.rpath(path), n).await
    }

    pub async fn lreaddir(&self, path: &str, n: i64) -> Result<Vec<FileMeta>> {
        readdir(&*self.shared.local_fs, &self.lpath(path), n).await
    }

    pub async fn rremove(&self, path: &str, recursive: bool) -> Result<()> {
        remove(&*self.shared.remote_fs, &self.rpath(path), recursive).await
    }

    pub async fn lremove(&self, path: &str, recursive: bool) -> Result<()> {
        remove(&*self.shared.local_fs, &self.lpath(path), recursive).await
    }

    pub async fn rexists(&self, path: &str) -> Result<bool> {
        exists(&*self.shared.remote_fs, &self.rpath(path)).await
    }

    pub async fn lexists(&self, path: &str) -> Result<bool> {
        exists(&*self.shared.local_fs, &self.lpath(path)).await
    }

    /// Copies a local file or directory tree to the remote side.
    pub async fn put(&self, local: &str, remote: &str) -> Result<()> {
        sync_entry(
            self.shared.local_fs.clone(),
            self.shared.remote_fs.clone(),
            self.lpath(local),
            self.rpath(remote),
        )
        .await
    }

    /// Copies a remote file or directory tree to the local side.
    pub async fn get(&self, remote: &str, local: &str) -> Result<()> {
        sync_entry(
            self.shared.remote_fs.clone(),
            self.shared.local_fs.clone(),
            self.rpath(remote),
            self.lpath(local),
        )
        .await
    }
}

/// Draws a ticket and opens a session, consuming a slot and retrying when
/// the server prohibits the channel.
pub(crate) async fn take_session<T, F, Fut>(
    pool: &SessionPool,
    mut open: F,
) -> Result<(SessionTicket, T)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let Some(ticket) = pool.take().await else {
            return Err(Error::ConnClosed);
        };
        match open().await {
            Ok(value) => return Ok((ticket, value)),
            Err(e) if e.is_session_prohibited() => {
                debug!("session prohibited, consuming slot and retrying");
                ticket.invalidate();
            }
            Err(e) => {
                ticket.release();
                return Err(e);
            }
        }
    }
}

fn compose_command(cwd: &str, env: &[&str], cmd: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    let cd;
    if !cwd.is_empty() {
        cd = format!("cd {}", cwd);
        parts.push(cd.as_str());
    }
    let export;
    let env_join = env.join(" ");
    if !env_join.is_empty() {
        export = format!("export {}", env_join);
        parts.push(export.as_str());
    }
    parts.push(cmd);
    parts.join(&format!(" {} ", CMD_SEPARATOR))
}

fn background_command(cmd: &str, stdout: &str, stderr: &str) -> String {
    let stdout = if stdout.is_empty() { "nohup.out" } else { stdout };
    let stderr = if stderr.is_empty() || stderr == stdout {
        "&1"
    } else {
        stderr
    };
    format!("nohup {} >{} 2>{} </dev/null &", cmd, stdout, stderr)
}

/// Opens a path for I/O, rejecting directories. A failed stat after a
/// successful open is ignored.
async fn open_checked(
    fs: &dyn Fs,
    path: &str,
    flags: OpenFlags,
    mode: u32,
) -> Result<Box<dyn FsFile>> {
    let mut fd = fs.open_file(path, flags, mode).await?;
    match fd.stat().await {
        Ok(meta) if meta.is_dir() => {
            let _ = fd.close().await;
            Err(Error::DestIsDirectory)
        }
        _ => Ok(fd),
    }
}

async fn read_file(fs: &dyn Fs, path: &str) -> Result<Vec<u8>> {
    let mut fd = open_checked(fs, path, OpenFlags::READ, 0o644).await?;
    let mut data = Vec::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = fd.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    fd.close().await?;
    Ok(data)
}

async fn write_file(fs: &dyn Fs, path: &str, data: &[u8]) -> Result<()> {
    let mut fd = open_checked(
        fs,
        path,
        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
        0o644,
    )
    .await?;
    let mut written = 0;
    while written < data.len() {
        written += fd.write(&data[written..]).await?;
    }
    fd.close().await
}

async fn readdir(fs: &dyn Fs, path: &str, n: i64) -> Result<Vec<FileMeta>> {
    let mut fd = fs.open(path).await?;
    let result = fd.readdir(n).await;
    let _ = fd.close().await;
    let mut entries = result?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn remove(fs: &dyn Fs, path: &str, recursive: bool) -> Result<()> {
    if recursive {
        fs.remove_all(path).await
    } else {
        fs.remove(path).await
    }
}

async fn exists(fs: &dyn Fs, path: &str) -> Result<bool> {
    match fs.stat(path).await {
        Ok(_) => Ok(true),
        Err(e) if fs.is_not_exist(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Recursive copy of one entry. Directories recurse pairwise with each
/// side's own path engine joining the names.
fn sync_entry(
    src: Arc<dyn Fs>,
    dst: Arc<dyn Fs>,
    src_path: String,
    dst_path: String,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let mut fd = src.open(&src_path).await?;
        let meta = src.stat(&src_path).await?;
        if !meta.is_dir() {
            return sync_file(&*dst, &dst_path, fd, meta).await;
        }

        let entries = fd.readdir(-1).await?;
        let _ = fd.close().await;
        for entry in entries {
            let src_child = src.path_engine().join(&[&src_path, &entry.name]);
            let dst_child = dst.path_engine().join(&[&dst_path, &entry.name]);
            sync_entry(src.clone(), dst.clone(), src_child, dst_child).await?;
        }
        Ok(())
    })
}

async fn sync_file(
    dst: &dyn Fs,
    dst_path: &str,
    mut src_fd: Box<dyn FsFile>,
    meta: FileMeta,
) -> Result<()> {
    match dst.remove(dst_path).await {
        Ok(()) => {}
        Err(e) if dst.is_not_exist(&e) => {}
        Err(e) => return Err(e),
    }

    let (dir, _) = dst.path_engine().split(dst_path);
    let dir = dst.path_engine().from_slash(dir);
    if !dir.is_empty() {
        dst.mkdir_all(&dir, 0o755).await?;
    }

    let mut dst_fd = open_checked(
        dst,
        dst_path,
        OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
        meta.mode,
    )
    .await?;

    let bufsize = meta.size.min(COPY_BUFFER_SIZE).max(1) as usize;
    let mut buf = vec![0u8; bufsize];
    loop {
        let n = src_fd.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            written += dst_fd.write(&buf[written..n]).await?;
        }
    }
    dst_fd.close().await?;
    src_fd.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_command_fragments() {
        assert_eq!(
            compose_command("/srv", &["A=1", "B=2"], "ls -l"),
            "cd /srv && export A=1 B=2 && ls -l"
        );
        assert_eq!(compose_command("", &["A=1"], "ls"), "export A=1 && ls");
        assert_eq!(compose_command("/srv", &[], "ls"), "cd /srv && ls");
        assert_eq!(compose_command("", &[], "ls"), "ls");
    }

    #[test]
    fn background_command_defaults() {
        assert_eq!(
            background_command("sleep 1", "", ""),
            "nohup sleep 1 >nohup.out 2>&1 </dev/null &"
        );
        assert_eq!(
            background_command("x", "out.log", "out.log"),
            "nohup x >out.log 2>&1 </dev/null &"
        );
        assert_eq!(
            background_command("x", "out.log", "err.log"),
            "nohup x >out.log 2>err.log </dev/null &"
        );
    }

    #[tokio::test]
    async fn prohibited_open_consumes_slot_and_retries() {
        let pool = SessionPool::new(3);
        let mut calls = 0;
        let (ticket, value) = take_session(&pool, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(Error::SessionProhibited)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        // One slot consumed by the prohibited attempt, one held.
        assert_eq!(pool.available(), Some(1));
        ticket.release();
        assert_eq!(pool.available(), Some(2));
    }

    #[tokio::test]
    async fn other_open_errors_release_the_ticket() {
        let pool = SessionPool::new(2);
        let result =
            take_session(&pool, || async { Err::<(), _>(Error::ConnClosed) }).await;
        assert!(result.is_err());
        assert_eq!(pool.available(), Some(2));
    }

    #[tokio::test]
    async fn take_session_fails_on_closed_pool() {
        let pool = SessionPool::new(1);
        pool.close();
        let result = take_session(&pool, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::ConnClosed)));
    }

    #[tokio::test]
    async fn refcount_tracks_nop_handles() {
        let agent = Agent::local_only().unwrap();
        assert_eq!(agent.status().1, 0);

        let h1 = agent.nop_close();
        let h2 = agent.nop_close();
        assert_eq!(agent.status().1, 2);

        h1.close().await;
        assert_eq!(agent.status().1, 1);
        // Closing a non-owning handle twice decrements twice; callers pair
        // each handle with exactly one close.
        h2.close().await;
        assert_eq!(agent.status().1, 0);

        agent.close().await;
        // Owning close is idempotent.
        agent.close().await;
    }

    #[tokio::test]
    async fn lcmd_runs_in_lcwd_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::local_only().unwrap();
        agent.lcd(dir.path().to_str().unwrap());

        let out = agent.lcmd("pwd", &[]).await.unwrap();
        let printed = String::from_utf8_lossy(&out);
        assert_eq!(printed.trim(), dir.path().to_str().unwrap());

        let out = agent.lcmd("echo $GREETING", &["GREETING=hello"]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[tokio::test]
    async fn lcmd_nonzero_exit_carries_output() {
        let agent = Agent::local_only().unwrap();
        let err = agent
            .lcmd("echo doomed; exit 3", &[])
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { status, output } => {
                assert_eq!(status, 3);
                assert_eq!(String::from_utf8_lossy(&output).trim(), "doomed");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn tmp_cwd_copies_do_not_touch_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::local_only().unwrap();
        let original = agent.lcwd().to_string();

        let tmp = agent.tmp_lcd(dir.path().to_str().unwrap());
        assert_eq!(tmp.lcwd(), dir.path().to_str().unwrap());
        assert_eq!(agent.lcwd(), original);
        // Discarding the copy leaves the refcount untouched.
        drop(tmp);
        assert_eq!(agent.status().1, 0);
        agent.close().await;
    }

    #[tokio::test]
    async fn file_ops_on_local_only_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::local_only().unwrap();
        agent.lcd(dir.path().to_str().unwrap());
        agent.rcd(dir.path().to_str().unwrap());

        agent.lwrite_file("hello.txt", b"hi there").await.unwrap();
        assert_eq!(agent.lread_file("hello.txt").await.unwrap(), b"hi there");
        assert!(agent.lexists("hello.txt").await.unwrap());
        assert!(!agent.lexists("missing.txt").await.unwrap());

        agent.rwrite_file("remote.txt", b"r").await.unwrap();
        assert_eq!(agent.rread_file("remote.txt").await.unwrap(), b"r");

        let names: Vec<String> = agent
            .lreaddir(".", -1)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["hello.txt", "remote.txt"]);

        agent.lremove("hello.txt", false).await.unwrap();
        assert!(!agent.lexists("hello.txt").await.unwrap());
        agent.close().await;
    }

    #[tokio::test]
    async fn reading_a_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = Agent::local_only().unwrap();
        agent.lcd(dir.path().to_str().unwrap());
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let err = agent.lread_file("sub").await.unwrap_err();
        assert!(matches!(err, Error::DestIsDirectory));
        agent.close().await;
    }

    #[tokio::test]
    async fn put_copies_a_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        tokio::fs::create_dir_all(src.path().join("a/b")).await.unwrap();
        tokio::fs::write(src.path().join("top.txt"), b"top").await.unwrap();
        tokio::fs::write(src.path().join("a/one.txt"), b"one").await.unwrap();
        tokio::fs::write(src.path().join("a/b/two.txt"), b"twotwo").await.unwrap();

        let agent = Agent::local_only().unwrap();
        agent
            .put(
                src.path().to_str().unwrap(),
                dst.path().join("copy").to_str().unwrap(),
            )
            .await
            .unwrap();

        let read = |p: &str| std::fs::read(dst.path().join("copy").join(p)).unwrap();
        assert_eq!(read("top.txt"), b"top");
        assert_eq!(read("a/one.txt"), b"one");
        assert_eq!(read("a/b/two.txt"), b"twotwo");
        agent.close().await;
    }

    #[tokio::test]
    async fn get_overwrites_existing_file() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("f"), b"new content").await.unwrap();
        tokio::fs::write(dst.path().join("f"), b"old").await.unwrap();

        let agent = Agent::local_only().unwrap();
        agent
            .get(
                src.path().join("f").to_str().unwrap(),
                dst.path().join("f").to_str().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dst.path().join("f")).unwrap(), b"new content");
        agent.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn put_preserves_source_mode() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("script.sh");
        tokio::fs::write(&path, b"#!/bin/sh\n").await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();

        let agent = Agent::local_only().unwrap();
        agent
            .put(
                path.to_str().unwrap(),
                dst.path().join("script.sh").to_str().unwrap(),
            )
            .await
            .unwrap();

        let mode = std::fs::metadata(dst.path().join("script.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        agent.close().await;
    }

    #[tokio::test]
    async fn empty_file_copies() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("empty"), b"").await.unwrap();

        let agent = Agent::local_only().unwrap();
        agent
            .put(
                src.path().join("empty").to_str().unwrap(),
                dst.path().join("empty").to_str().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dst.path().join("empty")).unwrap(), b"");
        agent.close().await;
    }
}
