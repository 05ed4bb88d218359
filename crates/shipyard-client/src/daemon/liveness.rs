use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DaemonHandle;

/// How often the watchdog checks on the parent process.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Answers whether a process is still running.
pub trait ProcessProbe: Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system. PID 0 means "unsupervised" and is
/// always reported alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        pid == 0 || platform::is_alive(pid)
    }
}

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    pub fn is_alive(pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // No signal: existence and permission checks only.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            // The process exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(windows)]
mod platform {
    use windows::Win32::Foundation::{CloseHandle, FALSE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    const STILL_ACTIVE: u32 = 259;

    pub fn is_alive(pid: u32) -> bool {
        unsafe {
            let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid) else {
                return false;
            };
            let mut code = 0u32;
            let queried = GetExitCodeProcess(handle, &mut code).is_ok();
            let _ = CloseHandle(handle);
            queried && code == STILL_ACTIVE
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub fn is_alive(_pid: u32) -> bool {
        true
    }
}

/// Shut the daemon down once `parent_pid` is gone. Exits quietly when the
/// daemon stops for any other reason.
pub fn spawn_watchdog<P: ProcessProbe>(
    handle: DaemonHandle,
    parent_pid: u32,
    probe: P,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stopped = handle.stopped();
        tokio::pin!(stopped);

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                _ = &mut stopped => {
                    debug!("watchdog exiting");
                    return;
                }
                _ = ticker.tick() => {
                    if !probe.is_alive(parent_pid) {
                        warn!(parent_pid, "parent process exited; shutting down daemon");
                        handle.shutdown();
                        return;
                    }
                }
            }
        }
    })
}
