// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direct process control: detached spawn, liveness probe and signalling.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Server output file inside the log directory.
pub const SERVER_LOG: &str = "server.log";

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No such process when the signal was sent.
    AlreadyGone,
    /// Exited after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
}

fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// Whether `/proc` reports `pid` as a zombie.
pub fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Field 3 follows the parenthesised command name, which may itself contain spaces.
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// Null-signal liveness probe. Zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match signal::kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Spawn `postgres -D <data_dir>` in its own process group with output appended to
/// `<log_dir>/server.log`. Returns the server pid.
///
/// The child is reaped in the background so it never lingers as a zombie while this
/// process is alive; it keeps running after this process exits.
pub fn spawn_detached(binary: &Path, data_dir: &Path, log_dir: &Path) -> Result<u32> {
    let log_path = log_dir.join(SERVER_LOG);
    let open_log = || {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| Error::SupervisionFailure {
                message: format!("cannot open {}: {}", log_path.display(), e),
                hint: format!("check that {} exists and is writable", log_dir.display()),
            })
    };
    let stdout = open_log()?;
    let stderr = open_log()?;

    let mut child = Command::new(binary)
        .arg("-D")
        .arg(data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .spawn()
        .map_err(|e| Error::SupervisionFailure {
            message: format!("failed to spawn {}: {}", binary.display(), e),
            hint: "check that the server executable is installed and runnable".to_string(),
        })?;

    let pid = child.id().ok_or_else(|| Error::SupervisionFailure {
        message: "server exited before its pid could be read".to_string(),
        hint: format!("see {}", log_path.display()),
    })?;

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(pid, %status, "Server process exited"),
            Err(e) => debug!(pid, error = %e, "Waiting on server process failed"),
        }
    });

    info!(pid, binary = %binary.display(), data_dir = %data_dir.display(), "Spawned server");
    Ok(pid)
}

async fn wait_for_exit(pid: u32, poll: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// SIGTERM, poll for exit up to `timeout`, then SIGKILL and wait up to `kill_grace`.
pub async fn terminate(
    pid: u32,
    poll: Duration,
    timeout: Duration,
    kill_grace: Duration,
) -> Result<StopOutcome> {
    let Some(target) = to_pid(pid) else {
        return Ok(StopOutcome::AlreadyGone);
    };

    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) => debug!(pid, "Sent SIGTERM"),
        Err(Errno::ESRCH) => return Ok(StopOutcome::AlreadyGone),
        Err(e) => {
            return Err(Error::SupervisionFailure {
                message: format!("cannot signal pid {}: {}", pid, e),
                hint: "the server may belong to another user".to_string(),
            });
        }
    }

    if wait_for_exit(pid, poll, timeout).await {
        return Ok(StopOutcome::Graceful);
    }

    warn!(pid, timeout_secs = timeout.as_secs(), "Server ignored SIGTERM, sending SIGKILL");
    match signal::kill(target, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(StopOutcome::Graceful),
        Err(e) => {
            return Err(Error::SupervisionFailure {
                message: format!("cannot kill pid {}: {}", pid, e),
                hint: "the server may belong to another user".to_string(),
            });
        }
    }

    if wait_for_exit(pid, poll, kill_grace).await {
        Ok(StopOutcome::Killed)
    } else {
        Err(Error::SupervisionFailure {
            message: format!("pid {} still alive after SIGKILL", pid),
            hint: "the process may be stuck in uninterruptible I/O".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_zombie(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_terminate_sleeping_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let outcome = terminate(
            pid,
            Duration::from_millis(20),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        reaper.join().unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_ignoring_child_is_killed() {
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 1; done")
            .spawn()
            .unwrap();
        let pid = child.id();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reaper = std::thread::spawn(move || child.wait());

        let outcome = terminate(
            pid,
            Duration::from_millis(20),
            Duration::from_millis(300),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_detached_writes_log() {
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("fake-server");
        fs::write(&script, "#!/bin/sh\necho \"starting $@\"\nexec sleep 30\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&script, perms).unwrap();

        let pid = spawn_detached(&script, temp.path(), temp.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(is_alive(pid));

        let outcome = terminate(
            pid,
            Duration::from_millis(20),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);

        let log = fs::read_to_string(temp.path().join(SERVER_LOG)).unwrap();
        assert!(log.contains("starting -D"));
    }

    #[tokio::test]
    async fn test_terminate_gone_pid() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let outcome = terminate(
            pid,
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyGone);
    }
}
