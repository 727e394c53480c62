// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process and system health: pid liveness, terminate/kill escalation,
//! disk and memory readings, per-process CPU/RSS.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Point-in-time CPU/RSS reading for one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// Health readings the engine and recovery loop consume.
pub trait SystemMonitor: Send + Sync {
    /// Whether the pid names a live process.
    fn pid_alive(&self, pid: u32) -> bool;

    /// CPU% and RSS for the pid, if it exists.
    fn process_stats(&self, pid: u32) -> Option<ProcessStats>;

    /// System memory in use, 0..100.
    fn memory_used_percent(&self) -> f64;

    /// Free disk space in GiB for the filesystem holding `path`.
    fn disk_free_gb(&self, path: &Path) -> Option<f64>;

    /// Send SIGTERM. Returns false when the process is already gone.
    fn signal_terminate(&self, pid: u32) -> bool;

    /// Send SIGKILL. Returns false when the process is already gone.
    fn signal_kill(&self, pid: u32) -> bool;
}

/// Production monitor over `sysinfo` + `nix` + `fs2`.
pub struct SysMonitor {
    system: Mutex<System>,
}

impl SysMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}

impl SystemMonitor for SysMonitor {
    fn pid_alive(&self, pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything; EPERM
        // still means the pid is live.
        match kill(unix_pid(pid), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn process_stats(&self, pid: u32) -> Option<ProcessStats> {
        let mut system = self.system.lock();
        let sys_pid = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system.process(sys_pid).map(|p| ProcessStats {
            cpu_percent: p.cpu_usage(),
            rss_bytes: p.memory(),
        })
    }

    fn memory_used_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64 * 100.0
    }

    fn disk_free_gb(&self, path: &Path) -> Option<f64> {
        match fs2::available_space(path) {
            Ok(bytes) => Some(bytes as f64 / (1024.0 * 1024.0 * 1024.0)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read free disk space");
                None
            }
        }
    }

    fn signal_terminate(&self, pid: u32) -> bool {
        kill(unix_pid(pid), Signal::SIGTERM).is_ok()
    }

    fn signal_kill(&self, pid: u32) -> bool {
        kill(unix_pid(pid), Signal::SIGKILL).is_ok()
    }
}

/// Graceful termination: SIGTERM, wait out the grace window, then SIGKILL.
///
/// Returns true when the process exited within the grace window.
pub async fn terminate_pid(monitor: &dyn SystemMonitor, pid: u32, grace: Duration) -> bool {
    if !monitor.pid_alive(pid) {
        return true;
    }

    monitor.signal_terminate(pid);
    debug!(pid, "sent SIGTERM");

    let poll = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        tokio::time::sleep(poll).await;
        waited += poll;
        if !monitor.pid_alive(pid) {
            info!(pid, "process exited gracefully");
            return true;
        }
    }

    warn!(pid, "grace window elapsed, sending SIGKILL");
    monitor.signal_kill(pid);
    false
}

/// Minimal connectivity check used by the recovery loop.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// One ICMP echo to a public resolver.
pub struct PingProbe;

#[async_trait]
impl ConnectivityProbe for PingProbe {
    async fn is_connected(&self) -> bool {
        let mut cmd = tokio::process::Command::new("ping");
        cmd.args(["-c", "1", "-W", "2", "8.8.8.8"]);
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        match crate::subprocess::run_with_timeout(cmd, Duration::from_secs(10), "connectivity probe")
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

// ── Test fakes ───────────────────────────────────────────────────────────

/// Configurable monitor for tests. Records signals sent.
#[cfg(any(test, feature = "test-support"))]
pub struct FakeSystemMonitor {
    pub alive: Mutex<std::collections::HashSet<u32>>,
    pub stats: Mutex<std::collections::HashMap<u32, ProcessStats>>,
    pub memory_percent: Mutex<f64>,
    pub disk_free: Mutex<f64>,
    pub terminated: Mutex<Vec<u32>>,
    pub killed: Mutex<Vec<u32>>,
}

#[cfg(any(test, feature = "test-support"))]
impl Default for FakeSystemMonitor {
    fn default() -> Self {
        Self {
            alive: Mutex::new(std::collections::HashSet::new()),
            stats: Mutex::new(std::collections::HashMap::new()),
            memory_percent: Mutex::new(20.0),
            disk_free: Mutex::new(100.0),
            terminated: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl FakeSystemMonitor {
    pub fn with_alive(self, pids: impl IntoIterator<Item = u32>) -> Self {
        *self.alive.lock() = pids.into_iter().collect();
        self
    }

    pub fn with_disk_free(self, gb: f64) -> Self {
        *self.disk_free.lock() = gb;
        self
    }

    pub fn with_memory_percent(self, percent: f64) -> Self {
        *self.memory_percent.lock() = percent;
        self
    }

    pub fn set_stats(&self, pid: u32, cpu_percent: f32, rss_bytes: u64) {
        self.stats.lock().insert(
            pid,
            ProcessStats {
                cpu_percent,
                rss_bytes,
            },
        );
    }
}

#[cfg(any(test, feature = "test-support"))]
impl SystemMonitor for FakeSystemMonitor {
    fn pid_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }

    fn process_stats(&self, pid: u32) -> Option<ProcessStats> {
        self.stats.lock().get(&pid).copied()
    }

    fn memory_used_percent(&self) -> f64 {
        *self.memory_percent.lock()
    }

    fn disk_free_gb(&self, _path: &Path) -> Option<f64> {
        Some(*self.disk_free.lock())
    }

    fn signal_terminate(&self, pid: u32) -> bool {
        self.terminated.lock().push(pid);
        // SIGTERM makes the fake process exit immediately
        self.alive.lock().remove(&pid)
    }

    fn signal_kill(&self, pid: u32) -> bool {
        self.killed.lock().push(pid);
        self.alive.lock().remove(&pid)
    }
}

/// Fixed connectivity answer for tests.
#[cfg(any(test, feature = "test-support"))]
pub struct FakeConnectivity(pub bool);

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl ConnectivityProbe for FakeConnectivity {
    async fn is_connected(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
#[path = "system_tests.rs"]
mod tests;
