//! Forced termination of the shell's whole process tree.
//!
//! Escalation ladder on Unix: SIGTERM the process group, wait; SIGKILL,
//! wait; `sudo -n kill -9`, wait; then report whatever survived so the
//! server can tell clients exactly which PIDs are stuck.

use std::time::{Duration, Instant};

use serde::Serialize;

const GRACEFUL_WAIT: Duration = Duration::from_millis(700);
const FORCE_WAIT: Duration = Duration::from_millis(700);
const POLL_STEP: Duration = Duration::from_millis(80);
#[cfg(unix)]
const SUDO_WAIT: Duration = Duration::from_millis(700);

/// A process that survived the termination ladder.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
}

/// Result of a tree termination attempt.
#[derive(Debug)]
pub enum ResetOutcome {
    Clean,
    Failed {
        survivors: Vec<ProcessInfo>,
        reason: String,
    },
}

impl ResetOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ResetOutcome::Clean)
    }

    fn failed(survivors: Vec<ProcessInfo>) -> Self {
        ResetOutcome::Failed {
            survivors,
            reason: "some processes could not be terminated".to_string(),
        }
    }
}

#[cfg(unix)]
pub fn terminate_process_tree(pid: u32) -> ResetOutcome {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let pid = pid as i32;
    let pgid = getpgid(Some(Pid::from_raw(pid)))
        .map(|p| p.as_raw())
        .ok()
        .filter(|&p| p > 0)
        .unwrap_or(pid);

    let _ = killpg(Pid::from_raw(pgid), Signal::SIGTERM);
    if wait_for_group_exit(pgid, GRACEFUL_WAIT) {
        return ResetOutcome::Clean;
    }

    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    if wait_for_group_exit(pgid, FORCE_WAIT) {
        return ResetOutcome::Clean;
    }

    let _ = run_sudo_kill(pgid);
    if wait_for_group_exit(pgid, SUDO_WAIT) {
        return ResetOutcome::Clean;
    }

    if !group_alive(pgid) {
        return ResetOutcome::Clean;
    }

    let mut survivors = list_process_group(pgid);
    if survivors.is_empty() {
        survivors.push(ProcessInfo {
            pid,
            name: "unknown".to_string(),
        });
    }
    ResetOutcome::failed(survivors)
}

/// Best-effort privileged kill. Without passwordless sudo this is a
/// no-op and the ladder falls through to survivor reporting.
#[cfg(unix)]
fn run_sudo_kill(pgid: i32) -> std::io::Result<()> {
    std::process::Command::new("sudo")
        .args(["-n", "kill", "-9", &format!("-{pgid}")])
        .output()
        .map(|_| ())
}

#[cfg(unix)]
fn wait_for_group_exit(pgid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            return true;
        }
        std::thread::sleep(POLL_STEP);
    }
    !group_alive(pgid)
}

/// Signal 0 probes existence; EPERM still means the group is there.
#[cfg(unix)]
fn group_alive(pgid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if pgid <= 0 {
        return false;
    }
    match killpg(Pid::from_raw(pgid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(unix)]
fn list_process_group(pgid: i32) -> Vec<ProcessInfo> {
    let output = std::process::Command::new("ps")
        .args(["-o", "pid=", "-o", "comm=", "-g", &pgid.to_string()])
        .output();

    let output = match output {
        Ok(out) if out.status.success() => out,
        _ => {
            if group_alive(pgid) {
                return vec![ProcessInfo {
                    pid: pgid,
                    name: "process group".to_string(),
                }];
            }
            return Vec::new();
        }
    };

    let mut infos: Vec<ProcessInfo> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid: i32 = fields.next()?.parse().ok().filter(|&p| p > 0)?;
            let name = fields.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return None;
            }
            Some(ProcessInfo { pid, name })
        })
        .collect();

    infos.sort_by_key(|info| info.pid);
    infos
}

#[cfg(windows)]
pub fn terminate_process_tree(pid: u32) -> ResetOutcome {
    let root = pid as i32;

    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &root.to_string(), "/T"])
        .output();
    if wait_for_tree_exit(root, GRACEFUL_WAIT) {
        return ResetOutcome::Clean;
    }

    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &root.to_string(), "/T", "/F"])
        .output();
    if wait_for_tree_exit(root, FORCE_WAIT) {
        return ResetOutcome::Clean;
    }

    let mut survivors = list_process_tree(root);
    if survivors.is_empty() {
        survivors.push(ProcessInfo {
            pid: root,
            name: "unknown".to_string(),
        });
    }
    ResetOutcome::failed(survivors)
}

#[cfg(windows)]
fn wait_for_tree_exit(root: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if list_process_tree(root).is_empty() {
            return true;
        }
        std::thread::sleep(POLL_STEP);
    }
    list_process_tree(root).is_empty()
}

/// Walk the descendants of `root` via the system process table.
#[cfg(windows)]
fn list_process_tree(root: i32) -> Vec<ProcessInfo> {
    let output = std::process::Command::new("wmic")
        .args(["process", "get", "ProcessId,ParentProcessId,Name", "/format:csv"])
        .output();
    let Ok(output) = output else {
        return Vec::new();
    };

    let mut entries: Vec<(i32, i32, String)> = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines().skip(1) {
        let fields: Vec<&str> = line.trim().split(',').collect();
        // Node,Name,ParentProcessId,ProcessId
        if fields.len() < 4 {
            continue;
        }
        let name = fields[1].trim().to_string();
        let (Ok(parent), Ok(pid)) = (fields[2].trim().parse(), fields[3].trim().parse()) else {
            continue;
        };
        entries.push((pid, parent, name));
    }

    let mut tree: Vec<ProcessInfo> = Vec::new();
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        for (pid, parent, name) in &entries {
            if *parent == current {
                frontier.push(*pid);
                tree.push(ProcessInfo {
                    pid: *pid,
                    name: name.clone(),
                });
            }
            if *pid == current && *pid == root {
                tree.push(ProcessInfo {
                    pid: *pid,
                    name: name.clone(),
                });
            }
        }
    }

    tree.sort_by_key(|info| info.pid);
    tree.dedup_by_key(|info| info.pid);
    tree
}
