//! Shell process spawning on a fresh PTY.
//!
//! `portable-pty` supplies the platform PTY (a Unix pseudo-terminal or a
//! Windows pseudo-console); this module builds the shell command line,
//! installs the title integration, scrubs the environment, and hands the
//! session a handle it can write to, resize, and close.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Mutex;

/// Environment variable carrying the owner token. Never forwarded to the
/// shell so child processes cannot learn or propagate the secret.
pub const OWNER_TOKEN_ENV: &str = "ALICES_MIRROR_OWNER_TOKEN";

/// Overrides the marker in emitted title sequences (set by the share
/// launcher); read by the shell integration scripts, so it flows through
/// the environment untouched.
pub const TITLE_PREFIX_ENV: &str = "ALICES_MIRROR_TITLE_PREFIX";

/// Which shell to run inside the PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    PowerShell,
    Cmd,
    Custom(String),
}

impl ShellKind {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "bash" || trimmed.ends_with("/bash") {
            ShellKind::Bash
        } else if trimmed.eq_ignore_ascii_case("powershell") {
            ShellKind::PowerShell
        } else if trimmed.eq_ignore_ascii_case("cmd") {
            ShellKind::Cmd
        } else {
            ShellKind::Custom(trimmed.to_string())
        }
    }
}

/// Writable side of the current PTY. The writer lock serializes input
/// from all clients; `close` drops both ends, which unblocks the read
/// loop once the child is gone.
pub struct PtyHandle {
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl PtyHandle {
    fn new(master: Box<dyn MasterPty + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            master: StdMutex::new(Some(master)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let guard = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let Some(master) = guard.as_ref() else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows: clamp_dim(rows),
                cols: clamp_dim(cols),
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().context("shell not ready")?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn close(&self) {
        let master = {
            let mut guard = self.master.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        drop(master);
        if let Ok(mut guard) = self.writer.try_lock() {
            drop(guard.take());
        }
    }
}

/// A freshly started shell: the PTY handle the session keeps, plus the
/// pieces the run loop consumes (reader, waiter, killer).
pub struct SpawnedShell {
    pub pty: std::sync::Arc<PtyHandle>,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub pid: Option<u32>,
}

/// Start the shell attached to a new PTY sized `cols`×`rows` (falling
/// back to 80×24 while no client has resized yet). `rc_path` caches the
/// generated bash rc file across respawns.
pub fn spawn_shell(
    work_dir: &Path,
    shell: &ShellKind,
    rc_path: &mut Option<PathBuf>,
    cols: u16,
    rows: u16,
) -> Result<SpawnedShell> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: if rows > 0 { clamp_dim(rows) } else { 24 },
            cols: if cols > 0 { clamp_dim(cols) } else { 80 },
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open pty")?;

    let mut cmd = build_command(shell, rc_path)?;
    cmd.cwd(work_dir);
    // CommandBuilder starts from an empty environment; copy the parent's,
    // minus the owner token.
    for (key, value) in std::env::vars() {
        if key == OWNER_TOKEN_ENV {
            continue;
        }
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(cmd)
        .context("failed to start shell")?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone pty reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("failed to take pty writer")?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    Ok(SpawnedShell {
        pty: std::sync::Arc::new(PtyHandle::new(pair.master, writer)),
        reader,
        child,
        killer,
        pid,
    })
}

fn clamp_dim(value: u16) -> u16 {
    value.clamp(1, 32767)
}

#[cfg(unix)]
fn build_command(shell: &ShellKind, rc_path: &mut Option<PathBuf>) -> Result<CommandBuilder> {
    match shell {
        ShellKind::Bash => {
            let rc = ensure_bash_rc(rc_path)?;
            let mut cmd = CommandBuilder::new("bash");
            cmd.arg("--rcfile");
            cmd.arg(&rc);
            Ok(cmd)
        }
        ShellKind::PowerShell => Ok(CommandBuilder::new("powershell")),
        ShellKind::Cmd => Ok(CommandBuilder::new("cmd")),
        ShellKind::Custom(path) => Ok(CommandBuilder::new(path)),
    }
}

#[cfg(windows)]
fn build_command(shell: &ShellKind, _rc_path: &mut Option<PathBuf>) -> Result<CommandBuilder> {
    match shell {
        ShellKind::PowerShell | ShellKind::Bash => {
            let script = powershell_init_script();
            let mut cmd = CommandBuilder::new("powershell");
            cmd.args(["-NoLogo", "-NoExit", "-Command", script.as_str()]);
            Ok(cmd)
        }
        ShellKind::Cmd => {
            let init = cmd_init_command();
            let mut cmd = CommandBuilder::new("cmd");
            cmd.args(["/Q", "/V:ON", "/K", init.as_str()]);
            Ok(cmd)
        }
        ShellKind::Custom(path) => Ok(CommandBuilder::new(path)),
    }
}

/// Create (or reuse) the temporary rc file that wires the title
/// integration into bash. The file lives until OS temp cleanup; its
/// contents are derived and non-sensitive.
#[cfg(unix)]
fn ensure_bash_rc(rc_path: &mut Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = rc_path.as_ref() {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let mut file = tempfile::Builder::new()
        .prefix("alices-mirror-bashrc-")
        .tempfile()
        .context("failed to create bash rc file")?;
    file.write_all(bash_rc_script().as_bytes())
        .context("failed to write bash rc file")?;
    let (_, path) = file
        .keep()
        .context("failed to persist bash rc file")?;

    *rc_path = Some(path.clone());
    Ok(path)
}

/// Bash init: source the usual rc files, then install a DEBUG trap
/// (pre-exec) and a PROMPT_COMMAND entry (pre-prompt), each emitting
/// `ESC ] 0 ; <prefix>|<cwd>|<proc> BEL`. Pipes are stripped from both
/// fields and home-prefixed paths are shortened to `~...`.
#[cfg(unix)]
fn bash_rc_script() -> String {
    let lines = [
        "# alices mirror shell title integration",
        "if [ -f /etc/bash.bashrc ]; then . /etc/bash.bashrc; fi",
        "if [ -f ~/.bashrc ]; then . ~/.bashrc; fi",
        "",
        "if [ -z \"${ALICES_MIRROR_PROMPT_INSTALLED:-}\" ]; then",
        "  ALICES_MIRROR_PROMPT_INSTALLED=1",
        "  __alices_mirror_title_prefix=\"${ALICES_MIRROR_TITLE_PREFIX:-alices-mirror}|\"",
        "",
        "  __alices_mirror_emit_title() {",
        "    local cwd=\"$1\"",
        "    local proc=\"$2\"",
        "    cwd=${cwd//|/}",
        "    proc=${proc//|/}",
        "    printf '\\033]0;%s%s|%s\\007' \"$__alices_mirror_title_prefix\" \"$cwd\" \"$proc\"",
        "  }",
        "",
        "  __alices_mirror_format_cwd() {",
        "    local cwd=\"$PWD\"",
        "    local home=\"$HOME\"",
        "    if [ -n \"$home\" ] && [[ \"$cwd\" == \"$home\"* ]]; then",
        "      cwd=\"~${cwd#$home}\"",
        "      if [ -z \"$cwd\" ] || [ \"$cwd\" = \"~\" ]; then",
        "        cwd=\"~\"",
        "      fi",
        "    fi",
        "    printf '%s' \"$cwd\"",
        "  }",
        "",
        "  __alices_mirror_set_title() {",
        "    local proc=\"$1\"",
        "    if [ -z \"$proc\" ]; then",
        "      proc=\"bash\"",
        "    fi",
        "    local cwd",
        "    cwd=\"$(__alices_mirror_format_cwd)\"",
        "    __alices_mirror_emit_title \"$cwd\" \"$proc\"",
        "  }",
        "",
        "  __alices_mirror_precmd() {",
        "    __alices_mirror_set_title \"bash\"",
        "  }",
        "",
        "  __alices_mirror_preexec() {",
        "    local cmd=\"$1\"",
        "    if [ -z \"$cmd\" ]; then",
        "      return",
        "    fi",
        "    case \"$cmd\" in",
        "      __alices_mirror_*) return ;;",
        "    esac",
        "    cmd=\"${cmd#\"${cmd%%[![:space:]]*}\"}\"",
        "    cmd=\"${cmd%%[[:space:]]*}\"",
        "    if [ -z \"$cmd\" ]; then",
        "      return",
        "    fi",
        "    if [ \"$cmd\" = \"sudo\" ]; then",
        "      local rest=\"${1#sudo }\"",
        "      rest=\"${rest#\"${rest%%[![:space:]]*}\"}\"",
        "      if [ -n \"$rest\" ]; then",
        "        cmd=\"${rest%%[[:space:]]*}\"",
        "      fi",
        "    fi",
        "    __alices_mirror_set_title \"$cmd\"",
        "  }",
        "",
        "  __alices_mirror_prev_debug=$(trap -p DEBUG)",
        "  if [ -n \"$__alices_mirror_prev_debug\" ]; then",
        "    __alices_mirror_prev_debug=${__alices_mirror_prev_debug#*\\'}",
        "    __alices_mirror_prev_debug=${__alices_mirror_prev_debug%\\' DEBUG}",
        "  fi",
        "  __alices_mirror_debug_trap() {",
        "    if [ -n \"$__alices_mirror_prev_debug\" ]; then",
        "      eval \"$__alices_mirror_prev_debug\"",
        "    fi",
        "    __alices_mirror_preexec \"$BASH_COMMAND\"",
        "  }",
        "",
        "  trap '__alices_mirror_debug_trap' DEBUG",
        "  if [ -n \"${PROMPT_COMMAND:-}\" ]; then",
        "    case \";$PROMPT_COMMAND;\" in",
        "      *\";__alices_mirror_precmd;\"*) ;;",
        "      *) PROMPT_COMMAND=\"${PROMPT_COMMAND};__alices_mirror_precmd\" ;;",
        "    esac",
        "  else",
        "    PROMPT_COMMAND=\"__alices_mirror_precmd\"",
        "  fi",
        "fi",
        "",
    ];
    lines.join("\n")
}

#[cfg(windows)]
fn cmd_init_command() -> String {
    concat!(
        "if \"%ALICES_MIRROR_TITLE_PREFIX%\"==\"\" set \"ALICES_MIRROR_TITLE_PREFIX=alices-mirror\"",
        " & prompt $E]0;%ALICES_MIRROR_TITLE_PREFIX%^|$P^|cmd$E\\%PROMPT%",
    )
    .to_string()
}

#[cfg(windows)]
fn powershell_init_script() -> String {
    let lines = [
        "$ErrorActionPreference = 'SilentlyContinue'",
        "$script:__AlicesMirrorTitlePrefix = $env:ALICES_MIRROR_TITLE_PREFIX",
        "if (-not $script:__AlicesMirrorTitlePrefix) { $script:__AlicesMirrorTitlePrefix = 'alices-mirror' }",
        "$script:__AlicesMirrorTitlePrefix = $script:__AlicesMirrorTitlePrefix.Replace('|', '')",
        "function global:__AlicesMirrorFormatCwd {",
        "  $cwd = (Get-Location).Path",
        "  $home = $HOME",
        "  if ($home -and $cwd.StartsWith($home, [System.StringComparison]::OrdinalIgnoreCase)) {",
        "    $suffix = $cwd.Substring($home.Length)",
        "    if ($suffix) { return \"~$suffix\" }",
        "    return \"~\"",
        "  }",
        "  return $cwd",
        "}",
        "function global:__AlicesMirrorEmitTitle([string]$cwd, [string]$proc) {",
        "  if (-not $cwd) { $cwd = '' }",
        "  if (-not $proc) { $proc = '' }",
        "  $safeCwd = $cwd.Replace('|', '')",
        "  $safeProc = $proc.Replace('|', '')",
        "  $safePrefix = $script:__AlicesMirrorTitlePrefix",
        "  [Console]::Write(\"`e]0;$safePrefix|$safeCwd|$safeProc`a\")",
        "}",
        "function global:__AlicesMirrorSetTitle([string]$proc) {",
        "  $cwd = __AlicesMirrorFormatCwd",
        "  __AlicesMirrorEmitTitle $cwd $proc",
        "}",
        "$script:__AlicesMirrorOriginalPrompt = $function:prompt",
        "function global:prompt {",
        "  __AlicesMirrorSetTitle 'powershell'",
        "  if ($script:__AlicesMirrorOriginalPrompt) { & $script:__AlicesMirrorOriginalPrompt } else { \"PS $pwd> \" }",
        "}",
        "if (Get-Module -ListAvailable -Name PSReadLine) {",
        "  Import-Module PSReadLine -ErrorAction SilentlyContinue",
        "  Set-PSReadLineOption -CommandValidationHandler {",
        "    param($command)",
        "    if ($command) {",
        "      $cmdName = $command.Trim().Split()[0]",
        "      if ($cmdName) { __AlicesMirrorSetTitle $cmdName }",
        "    }",
        "    return $true",
        "  }",
        "}",
    ];
    lines.join("\n")
}
