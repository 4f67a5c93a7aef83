//! Parent-process watchdog.
//!
//! When the host supplies `WA_PARENT_PID`, a supervisor probes the parent
//! every second with a null signal and exits 0 as soon as the probe fails.
//! This keeps a crashed or force-quit host from orphaning the bridge.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Probe interval.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the supervisor task.
#[cfg(unix)]
pub fn spawn(parent_pid: i32, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    info!("watchdog armed for parent pid {parent_pid}");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !parent_alive(parent_pid) {
                info!("parent pid {parent_pid} is gone, exiting");
                // Watchdog-triggered exit is a graceful outcome for the host.
                std::process::exit(0);
            }
        }
    })
}

/// Null-signal liveness probe: `kill(pid, 0)` succeeds (or fails with EPERM)
/// while the process exists, and fails with ESRCH once it is gone.
#[cfg(unix)]
pub fn parent_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub fn spawn(parent_pid: i32, _cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tracing::warn!("watchdog not supported on this platform; ignoring parent pid {parent_pid}");
    tokio::spawn(async {})
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(parent_alive(std::process::id() as i32));
    }

    #[test]
    fn recycled_child_pid_is_dead() {
        // Spawn and reap a child; its pid is then (momentarily) unused.
        let child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id() as i32;
        let mut child = child;
        child.wait().expect("wait for child");
        assert!(!parent_alive(pid));
    }

    #[tokio::test]
    async fn probe_flips_when_watched_process_exits() {
        let child = std::process::Command::new("sleep")
            .arg("0.2")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;
        assert!(parent_alive(pid));
        let mut child = child;
        child.wait().expect("wait");
        assert!(!parent_alive(pid));
    }
}
