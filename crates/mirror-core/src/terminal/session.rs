//! The shared terminal session: one shell on one PTY, mirrored to every
//! client.
//!
//! A background run loop owns the shell lifecycle. The read loop is the
//! only PTY reader; it feeds the replay buffer and the title parser and
//! fans chunks out through a bounded channel. Writes from clients are
//! serialized through the PTY handle. When the shell exits it is
//! respawned, unless the session was closed or configured to follow the
//! shell down.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use portable_pty::ChildKiller;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::reset::{self, ResetOutcome};
use super::ring::RingBuffer;
use super::shell::{self, PtyHandle, ShellKind, SpawnedShell};
use super::title::{decode_mirror_title, OscTitleParser};

const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 128;
const STATUS_CHANNEL_CAPACITY: usize = 16;
const READ_CHUNK_SIZE: usize = 4096;
const RESPAWN_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub work_dir: PathBuf,
    pub shell: ShellKind,
    pub buffer_size: usize,
    pub exit_on_shell_exit: bool,
}

impl SessionConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            shell: ShellKind::parse(""),
            buffer_size: DEFAULT_BUFFER_SIZE,
            exit_on_shell_exit: false,
        }
    }
}

/// Receiving ends of the session's fan-out channels. Both close when the
/// session finalizes.
pub struct SessionEvents {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub status: mpsc::Receiver<String>,
}

struct Inner {
    pty: Option<Arc<PtyHandle>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    last_cols: u16,
    last_rows: u16,
    last_title_cwd: String,
    last_title_proc: String,
    rc_path: Option<PathBuf>,
    closed: bool,
}

pub struct Session {
    work_dir: PathBuf,
    shell: ShellKind,
    exit_on_shell_exit: bool,
    inner: StdMutex<Inner>,
    buffer: RingBuffer,
    output_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    status_tx: StdMutex<Option<mpsc::Sender<String>>>,
    done: CancellationToken,
}

impl Session {
    /// Create the session and start its run loop. Must be called from
    /// within a tokio runtime.
    pub fn new(cfg: SessionConfig) -> Result<(Arc<Self>, SessionEvents)> {
        if cfg.work_dir.as_os_str().is_empty() {
            bail!("work directory is required");
        }
        let buffer_size = if cfg.buffer_size > 0 {
            cfg.buffer_size
        } else {
            DEFAULT_BUFFER_SIZE
        };

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);

        let session = Arc::new(Self {
            work_dir: cfg.work_dir,
            shell: cfg.shell,
            exit_on_shell_exit: cfg.exit_on_shell_exit,
            inner: StdMutex::new(Inner {
                pty: None,
                killer: None,
                pid: None,
                last_cols: 0,
                last_rows: 0,
                last_title_cwd: String::new(),
                last_title_proc: String::new(),
                rc_path: None,
                closed: false,
            }),
            buffer: RingBuffer::new(buffer_size),
            output_tx: StdMutex::new(Some(output_tx)),
            status_tx: StdMutex::new(Some(status_tx)),
            done: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&session).run_loop());

        Ok((
            session,
            SessionEvents {
                output: output_rx,
                status: status_rx,
            },
        ))
    }

    /// One-shot feasibility probe: start a shell in `work_dir`, then tear
    /// it straight down. Used by configuration validation before any
    /// server state exists.
    pub fn check_shell(work_dir: &Path, shell: &ShellKind) -> Result<()> {
        let mut rc_path = None;
        let spawned = shell::spawn_shell(work_dir, shell, &mut rc_path, 0, 0)?;
        spawned.pty.close();
        let SpawnedShell {
            mut killer,
            mut child,
            ..
        } = spawned;
        let _ = killer.kill();
        let _ = child.wait();
        Ok(())
    }

    /// Cancelled when the session has fully shut down.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Copy of the replay buffer for a newly attached client.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buffer.snapshot()
    }

    /// Forward raw client input to the shell. Writes are serialized by
    /// the PTY handle's writer lock.
    pub async fn write_input(&self, data: &[u8]) -> Result<()> {
        let pty = self
            .current_pty()
            .ok_or_else(|| anyhow!("shell not ready"))?;
        pty.write_all(data).await
    }

    /// Remember the latest dimensions and apply them to the current PTY,
    /// if any. Respawned shells start at the remembered size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            bail!("invalid terminal size");
        }
        let pty = {
            let mut inner = self.lock_inner();
            inner.last_cols = cols;
            inner.last_rows = rows;
            inner.pty.clone()
        };
        match pty {
            Some(pty) => pty.resize(cols, rows),
            None => Ok(()),
        }
    }

    /// Kill the shell's whole process tree. Closing the PTY first makes
    /// the read loop observe EOF, so the run loop respawns once the tree
    /// is gone.
    pub async fn reset(&self) -> Result<ResetOutcome> {
        let (pty, pid) = {
            let inner = self.lock_inner();
            (inner.pty.clone(), inner.pid)
        };
        let (Some(pty), Some(pid)) = (pty, pid) else {
            bail!("shell not ready");
        };

        pty.close();
        tokio::task::spawn_blocking(move || reset::terminate_process_tree(pid))
            .await
            .context("reset task failed")
    }

    /// Directory the shell is currently in: `/proc/<pid>/cwd` when the
    /// kernel exposes it, otherwise the last title-reported cwd with a
    /// leading `~` expanded.
    pub fn current_dir(&self) -> Result<PathBuf> {
        #[cfg(unix)]
        if let Some(pid) = self.shell_pid() {
            if let Ok(target) = std::fs::read_link(format!("/proc/{pid}/cwd")) {
                if !target.as_os_str().is_empty() {
                    return Ok(clean_path(&target));
                }
            }
        }

        let title_cwd = {
            let inner = self.lock_inner();
            inner.last_title_cwd.clone()
        };
        if title_cwd.trim().is_empty() {
            bail!("current directory not available");
        }
        let expanded = expand_leading_tilde(&title_cwd)?;
        if expanded.as_os_str().is_empty() {
            bail!("current directory not available");
        }
        Ok(clean_path(&expanded))
    }

    /// Last command name reported by the title integration.
    pub fn current_proc(&self) -> Option<String> {
        let inner = self.lock_inner();
        if inner.last_title_proc.is_empty() {
            None
        } else {
            Some(inner.last_title_proc.clone())
        }
    }

    pub fn shell_pid(&self) -> Option<u32> {
        self.lock_inner().pid
    }

    /// Idempotent shutdown: mark closed, close the PTY, kill the shell.
    /// The run loop finalizes the channels once the read loop drains.
    pub fn close(&self) {
        let (pty, killer) = {
            let mut inner = self.lock_inner();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (inner.pty.clone(), inner.killer.take())
        };
        if let Some(pty) = pty {
            pty.close();
        }
        if let Some(mut killer) = killer {
            let _ = killer.kill();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                self.finalize();
                return;
            }

            let spawned = self.start_shell();
            let spawned = match spawned {
                Ok(spawned) => spawned,
                Err(err) => {
                    self.emit_status(format!("Shell start failed: {err:#}"));
                    tokio::time::sleep(RESPAWN_DELAY).await;
                    continue;
                }
            };

            let SpawnedShell {
                pty,
                reader,
                mut child,
                killer,
                pid,
            } = spawned;

            self.set_pty(Arc::clone(&pty), killer, pid);
            self.emit_status("Shell started.");
            debug!(pid = ?pid, "shell started");

            let waiter = tokio::task::spawn_blocking(move || child.wait());
            let read_session = Arc::clone(&self);
            let read_task = tokio::task::spawn_blocking(move || read_session.read_loop(reader));

            let _ = read_task.await;
            pty.close();
            let _ = waiter.await;
            self.clear_pty();

            if self.is_closed() {
                self.finalize();
                return;
            }
            if self.exit_on_shell_exit {
                self.emit_status("Shell exited.");
                self.mark_closed();
                self.finalize();
                return;
            }
            self.emit_status("Shell exited. Respawning now.");
        }
    }

    fn start_shell(&self) -> Result<SpawnedShell> {
        let (cols, rows, mut rc_path) = {
            let mut inner = self.lock_inner();
            (inner.last_cols, inner.last_rows, inner.rc_path.take())
        };
        let result = shell::spawn_shell(&self.work_dir, &self.shell, &mut rc_path, cols, rows);
        {
            let mut inner = self.lock_inner();
            inner.rc_path = rc_path;
        }
        result
    }

    /// Sole reader of the PTY. Runs on a blocking thread until the shell
    /// side goes away.
    fn read_loop(&self, mut reader: Box<dyn std::io::Read + Send>) {
        let mut parser = OscTitleParser::new();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    let chunk = &buf[..n];
                    for title in parser.feed(chunk) {
                        self.capture_title(&title);
                    }
                    self.buffer.append(chunk);
                    self.emit_output(chunk.to_vec());
                }
                Err(_) => return,
            }
        }
    }

    fn capture_title(&self, title: &str) {
        let Some((cwd, proc)) = decode_mirror_title(title) else {
            return;
        };
        let mut inner = self.lock_inner();
        if !cwd.is_empty() {
            inner.last_title_cwd = cwd;
        }
        if !proc.is_empty() {
            inner.last_title_proc = proc;
        }
    }

    /// Non-blocking send; chunks are dropped when the broadcaster cannot
    /// keep up, trading delivery for liveness.
    fn emit_output(&self, data: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        let guard = self.output_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(data).is_err() {
                debug!("output channel full, dropping chunk");
            }
        }
    }

    fn emit_status(&self, message: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        let guard = self.status_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(message.into()).is_err() {
                warn!("status channel full, dropping message");
            }
        }
    }

    fn set_pty(
        &self,
        pty: Arc<PtyHandle>,
        killer: Box<dyn ChildKiller + Send + Sync>,
        pid: Option<u32>,
    ) {
        let mut inner = self.lock_inner();
        inner.pty = Some(pty);
        inner.killer = Some(killer);
        inner.pid = pid;
    }

    fn clear_pty(&self) {
        let mut inner = self.lock_inner();
        inner.pty = None;
        inner.killer = None;
        inner.pid = None;
    }

    fn current_pty(&self) -> Option<Arc<PtyHandle>> {
        self.lock_inner().pty.clone()
    }

    fn mark_closed(&self) {
        self.lock_inner().closed = true;
    }

    /// Close the fan-out channels exactly once and signal done.
    fn finalize(&self) {
        drop(
            self.output_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        drop(
            self.status_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        self.done.cancel();
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lexically normalize a path: drop `.` segments, resolve `..` against
/// the accumulated prefix.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(Component::ParentDir);
                }
            }
            other => cleaned.push(other),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

fn expand_leading_tilde(value: &str) -> Result<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("path is empty");
    }
    if trimmed == "~" {
        return dirs::home_dir().context("home directory not available");
    }
    if let Some(rest) = trimmed.strip_prefix('~') {
        if rest.starts_with('/') || rest.starts_with('\\') {
            let home = dirs::home_dir().context("home directory not available")?;
            let rest = rest.trim_start_matches(['/', '\\']);
            if rest.is_empty() {
                return Ok(home);
            }
            return Ok(home.join(rest));
        }
    }
    Ok(PathBuf::from(trimmed))
}
