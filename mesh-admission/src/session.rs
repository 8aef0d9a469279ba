//! Session controller escalation
//!
//! When onboarding fails the whole daemon is told to drop its connections
//! and then to reap its children. How that is delivered is hidden behind
//! [`SessionController`]; the production implementation signals the daemon.

use crate::process::Signaller;
use crate::types::{SessionConfig, Signal};
use anyhow::{Context, Result};
use std::future::Future;

/// Capability to tear down the VPN daemon's sessions
pub trait SessionController {
    /// Ask the daemon to drop every connection it holds
    fn drop_all(&self) -> impl Future<Output = Result<()>> + Send;

    /// Ask the daemon to reap its terminated worker processes
    fn reap(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Session controller that signals the daemon process
#[derive(Debug, Clone)]
pub struct SignalSession<S> {
    daemon_pid: u32,
    drop_signal: Signal,
    reap_signal: Signal,
    signaller: S,
}

impl<S: Signaller + Sync> SignalSession<S> {
    /// Create a controller for the daemon with pid `daemon_pid`
    pub fn new(daemon_pid: u32, config: &SessionConfig, signaller: S) -> Self {
        Self {
            daemon_pid,
            drop_signal: config.drop_signal,
            reap_signal: config.reap_signal,
            signaller,
        }
    }

    /// Process id of the daemon
    pub fn daemon_pid(&self) -> u32 {
        self.daemon_pid
    }
}

impl<S: Signaller + Sync> SessionController for SignalSession<S> {
    async fn drop_all(&self) -> Result<()> {
        log::info!(
            "Dropping all connections of daemon {} (SIG{})",
            self.daemon_pid,
            self.drop_signal.name()
        );
        self.signaller
            .send(self.daemon_pid, self.drop_signal)
            .await
            .context("Failed to signal drop-all")
    }

    async fn reap(&self) -> Result<()> {
        log::info!(
            "Reaping children of daemon {} (SIG{})",
            self.daemon_pid,
            self.reap_signal.name()
        );
        self.signaller
            .send(self.daemon_pid, self.reap_signal)
            .await
            .context("Failed to signal reap")
    }
}
