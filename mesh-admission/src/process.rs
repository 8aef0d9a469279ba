//! Process liveness and signal delivery
//!
//! Liveness is answered from `/proc`, signals are delivered with `kill(1)`
//! so the hooks need no platform bindings of their own.

use crate::types::Signal;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use tokio::process::Command;

/// Answers whether a process id currently belongs to a running process
pub trait Liveness {
    /// Returns true if `pid` is alive
    fn is_alive(&self, pid: u32) -> Result<bool>;

    /// Start time of `pid` in clock ticks since boot, if known
    fn start_time(&self, _pid: u32) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Returns true if `pid` is alive and, when both start times are
    /// known, is still the process that started at `started`
    fn is_running(&self, pid: u32, started: Option<u64>) -> Result<bool> {
        if !self.is_alive(pid)? {
            return Ok(false);
        }
        match (started, self.start_time(pid)?) {
            (Some(expected), Some(actual)) => Ok(expected == actual),
            _ => Ok(true),
        }
    }
}

/// Extract the start time (field 22) from the content of `/proc/<pid>/stat`
pub fn parse_stat_start_time(stat: &str) -> Result<u64> {
    // The command name (field 2) may itself contain spaces and parentheses
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .context("Malformed stat line")?;
    rest.split_whitespace()
        .nth(19)
        .context("Stat line too short")?
        .parse::<u64>()
        .context("Invalid start time")
}

/// Liveness probe backed by `/proc/<pid>`
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    /// Probe the system's `/proc`
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/proc"))
    }

    /// Probe an alternative procfs mount
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness for ProcFs {
    fn is_alive(&self, pid: u32) -> Result<bool> {
        if pid == 0 {
            return Ok(false);
        }
        anyhow::ensure!(
            self.root.is_dir(),
            "{} is not available",
            self.root.display()
        );
        Ok(self.root.join(pid.to_string()).exists())
    }

    fn start_time(&self, pid: u32) -> Result<Option<u64>> {
        let path = self.root.join(pid.to_string()).join("stat");
        match std::fs::read_to_string(&path) {
            Ok(stat) => parse_stat_start_time(&stat)
                .with_context(|| format!("Bad {}", path.display()))
                .map(Some),
            // Exited between the two probes, or no stat file at all
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

/// Delivers signals to other processes
pub trait Signaller {
    /// Send `signal` to `pid`
    fn send(&self, pid: u32, signal: Signal) -> impl Future<Output = Result<()>> + Send;
}

/// Signaller that runs `kill -s <SIG> <pid>`
#[derive(Debug, Clone, Default)]
pub struct KillCommand;

impl Signaller for KillCommand {
    async fn send(&self, pid: u32, signal: Signal) -> Result<()> {
        // pid 0 would address our own process group
        anyhow::ensure!(pid > 1, "Refusing to signal pid {}", pid);

        log::debug!("Sending SIG{} to pid {}", signal.name(), pid);

        let output = Command::new("kill")
            .args(["-s", signal.name(), &pid.to_string()])
            .output()
            .await
            .context("Failed to execute kill")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("kill -s {} {} failed: {}", signal.name(), pid, stderr.trim());
        }

        Ok(())
    }
}
