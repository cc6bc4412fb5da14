//! Process-wide registry of spawned tool subprocesses.
//!
//! Every ffmpeg/ffprobe/yt-dlp child is tracked here by pid so the shutdown
//! path can terminate stragglers without re-acquiring any queue lock:
//! graceful termination first, then a bounded grace wait, then a hard kill,
//! and finally a platform sweep for orphaned `ffmpeg` processes.

use std::collections::HashSet;
use std::process::{Child, Command, Output, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::sync_ext::MutexExt;

static TRACKED_PIDS: Lazy<Mutex<HashSet<u32>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Grace window between terminate and kill during shutdown.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Guard returned by [`track`]; untracks the pid when dropped.
pub struct TrackedChild {
    pid: u32,
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        TRACKED_PIDS.lock_unpoisoned().remove(&self.pid);
    }
}

pub fn track(child: &Child) -> TrackedChild {
    let pid = child.id();
    TRACKED_PIDS.lock_unpoisoned().insert(pid);
    TrackedChild { pid }
}

pub fn tracked_count() -> usize {
    TRACKED_PIDS.lock_unpoisoned().len()
}

fn is_tracked(pid: u32) -> bool {
    TRACKED_PIDS.lock_unpoisoned().contains(&pid)
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) {
    let sig = if force { "-KILL" } else { "-TERM" };
    let _ = Command::new("kill").arg(sig).arg(pid.to_string()).status();
}

#[cfg(windows)]
fn signal_pid(pid: u32, force: bool) {
    let mut cmd = Command::new("taskkill");
    if force {
        cmd.arg("/F");
    }
    let _ = cmd.arg("/PID").arg(pid.to_string()).status();
}

/// Terminate every tracked subprocess: graceful signal, wait up to
/// [`KILL_GRACE`], then force-kill survivors.
pub fn terminate_all() {
    let pids: Vec<u32> = TRACKED_PIDS.lock_unpoisoned().iter().copied().collect();
    if pids.is_empty() {
        return;
    }
    debug!(count = pids.len(), "terminating tracked subprocesses");

    for pid in &pids {
        signal_pid(*pid, false);
    }
    std::thread::sleep(KILL_GRACE);
    for pid in &pids {
        signal_pid(*pid, true);
    }
    TRACKED_PIDS.lock_unpoisoned().clear();
}

/// Best-effort sweep for `ffmpeg` processes that escaped tracking, e.g.
/// after a crashed worker. Platform-specific and intentionally blunt.
pub fn kill_orphaned_ffmpeg() {
    #[cfg(unix)]
    {
        let _ = Command::new("pkill").arg("-9").arg("-x").arg("ffmpeg").status();
    }
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .arg("/F")
            .arg("/IM")
            .arg("ffmpeg.exe")
            .status();
    }
    warn!("issued orphan ffmpeg sweep");
}

/// Run a short-lived probe command to completion with a hard deadline.
///
/// stdout/stderr are drained on pump threads so a chatty tool cannot block
/// on a full pipe; on timeout the child is killed and an error returned.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn subprocess")?;
    let _tracked = track(&child);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_pump = std::thread::spawn(move || drain(stdout));
    let err_pump = std::thread::spawn(move || drain(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait().context("failed to poll subprocess")? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            // Let the pumps finish reading whatever was flushed.
            let _ = out_pump.join();
            let _ = err_pump.join();
            bail!("subprocess exceeded {}s timeout", timeout.as_secs());
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    let stdout = out_pump.join().unwrap_or_default();
    let stderr = err_pump.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn drain<R: std::io::Read>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_captures_output() {
        let output = run_with_timeout(
            Command::new("sh").arg("-c").arg("echo hello; echo oops >&2"),
            Duration::from_secs(5),
        )
        .expect("command runs");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn run_with_timeout_kills_hung_commands() {
        let start = Instant::now();
        let result = run_with_timeout(
            Command::new("sh").arg("-c").arg("sleep 30"),
            Duration::from_millis(200),
        );
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn tracking_guard_untracks_on_drop() {
        let child = Command::new(if cfg!(windows) { "cmd" } else { "sh" })
            .arg(if cfg!(windows) { "/C" } else { "-c" })
            .arg("exit 0")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Ok(mut child) = child {
            let pid = child.id();
            let guard = track(&child);
            assert!(is_tracked(pid));
            let _ = child.wait();
            drop(guard);
            assert!(!is_tracked(pid));
        }
    }
}
