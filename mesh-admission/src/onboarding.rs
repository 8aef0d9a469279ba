// Onboarding procedure launcher

//! Launching the external onboarding procedure
//!
//! The procedure is an opaque program; only its exit status matters. Its
//! command line is built from a template list whose `{placeholders}` are
//! filled from the connection attempt, and it also receives the daemon's
//! hook environment (`PEER_KEY`, `INTERFACE`, ...).

use crate::types::{ConnectionAttempt, OnboardingConfig};
use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Placeholders accepted in onboarding argument templates
pub const PLACEHOLDERS: &[&str] = &[
    "peer_key",
    "interface",
    "segment",
    "daemon_pid",
    "mtu",
    "remote_address",
    "blacklist_dir",
    "git_repo",
];

/// How an onboarding run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureExit {
    /// Exit status 0
    Success,
    /// Non-zero exit status
    Code(i32),
    /// Terminated by a signal (including preemption)
    Killed,
}

impl ProcedureExit {
    /// True only for exit status 0
    pub fn is_success(&self) -> bool {
        matches!(self, ProcedureExit::Success)
    }
}

impl fmt::Display for ProcedureExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureExit::Success => write!(f, "exit 0"),
            ProcedureExit::Code(code) => write!(f, "exit {}", code),
            ProcedureExit::Killed => write!(f, "killed by signal"),
        }
    }
}

/// The long-running provisioning routine
pub trait OnboardingProcedure {
    /// Run to completion. `on_spawn` is called with the worker's process id
    /// as soon as it is known. A failure to start is an error.
    fn run<F>(
        &self,
        attempt: &ConnectionAttempt,
        on_spawn: F,
    ) -> impl Future<Output = Result<ProcedureExit>> + Send
    where
        F: FnOnce(u32) + Send;
}

/// Onboarding procedure run as a child process
#[derive(Debug, Clone)]
pub struct CommandProcedure {
    program: PathBuf,
    args: Vec<String>,
    blacklist_dir: PathBuf,
    git_repo: Option<PathBuf>,
}

impl CommandProcedure {
    /// Build from configuration
    pub fn new(config: &OnboardingConfig, blacklist_dir: PathBuf) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            blacklist_dir,
            git_repo: config.git_repo.clone(),
        }
    }

    fn placeholder_value(&self, name: &str, attempt: &ConnectionAttempt) -> Option<String> {
        let value = match name {
            "peer_key" => attempt.peer_key.to_string(),
            "interface" => attempt.interface.to_string(),
            "segment" => attempt.interface.segment().to_string(),
            "daemon_pid" => attempt.daemon_pid.to_string(),
            "mtu" => attempt.mtu.to_string(),
            "remote_address" => attempt.remote_address.clone(),
            "blacklist_dir" => self.blacklist_dir.display().to_string(),
            "git_repo" => self.git_repo.as_ref()?.display().to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Fill the placeholders of one argument template
    pub fn expand(&self, template: &str, attempt: &ConnectionAttempt) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .with_context(|| format!("Unterminated placeholder in {:?}", template))?;
            let name = &after[..end];
            let value = self
                .placeholder_value(name, attempt)
                .with_context(|| format!("No value for placeholder {{{}}}", name))?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }

    /// Full argument list for `attempt`
    pub fn command_args(&self, attempt: &ConnectionAttempt) -> Result<Vec<String>> {
        self.args.iter().map(|a| self.expand(a, attempt)).collect()
    }
}

impl OnboardingProcedure for CommandProcedure {
    async fn run<F>(&self, attempt: &ConnectionAttempt, on_spawn: F) -> Result<ProcedureExit>
    where
        F: FnOnce(u32) + Send,
    {
        let args = self.command_args(attempt)?;

        log::info!(
            "Starting onboarding for {} on {}: {} {}",
            attempt.peer_key,
            attempt.interface,
            self.program.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("PEER_KEY", attempt.peer_key.as_str())
            .env("INTERFACE", attempt.interface.as_str())
            .env("FASTD_PID", attempt.daemon_pid.to_string())
            .env("INTERFACE_MTU", attempt.mtu.to_string())
            .env("PEER_ADDRESS", &attempt.remote_address)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to execute {}", self.program.display()))?;

        if let Some(pid) = child.id() {
            on_spawn(pid);
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for onboarding procedure")?;

        let exit = match status.code() {
            Some(0) => ProcedureExit::Success,
            Some(code) => ProcedureExit::Code(code),
            None => ProcedureExit::Killed,
        };

        log::debug!("Onboarding procedure finished: {}", exit);
        Ok(exit)
    }
}
