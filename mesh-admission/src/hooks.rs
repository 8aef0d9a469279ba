//! Hook entry points
//!
//! Glue between the configuration, the production backends and the
//! engines: each function handles one daemon hook invocation end to end,
//! including its audit line, and returns the process exit status.

use crate::admission::AdmissionEngine;
use crate::audit_log::{AuditLog, Category};
use crate::coordinator::OnboardingCoordinator;
use crate::fs_store::FileStore;
use crate::onboarding::CommandProcedure;
use crate::process::{KillCommand, ProcFs};
use crate::session::SignalSession;
use crate::single_flight::SingleFlight;
use crate::types::{Config, ConnectionAttempt, InterfaceName, PeerKey, RunState};
use chrono::{DateTime, Local};
use std::time::Duration;

/// Wall clock for one invocation
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// UNIX seconds, used for TTLs and lock records
    pub unix: u64,
    /// Local time, used for audit file names and lines
    pub local: DateTime<Local>,
}

impl Clock {
    /// Read the current time
    pub fn now() -> Self {
        let local = Local::now();
        Self {
            unix: u64::try_from(local.timestamp()).unwrap_or(0),
            local,
        }
    }
}

/// Build the file store described by `config`
pub fn file_store(config: &Config) -> FileStore {
    FileStore::new(config.blacklist_dir(), config.lock_dir())
}

/// Build the audit log writer described by `config`
pub fn audit_log(config: &Config) -> AuditLog {
    AuditLog::new(config.general.log_dir.clone(), config.general.log_retention)
}

/// Handle a verify hook. Returns 0 to accept, 1 to deny.
pub fn run_verify(config: &Config, peer: &PeerKey, interface: &InterfaceName, clock: Clock) -> i32 {
    let store = file_store(config);
    let liveness = ProcFs::new();
    let engine = AdmissionEngine::new(&store, &liveness, config.blacklist.ttl);

    let verdict = engine.verify(peer, interface, clock.unix);
    log::info!("{} {} on {}: {}", verdict.label(), peer, interface, verdict);

    audit_log(config).record(
        Category::Verify,
        clock.local,
        &format!("{} {} {} {}", verdict.label(), interface, peer, verdict),
    );

    verdict.exit_code()
}

/// Handle an establish hook. Returns 1 only when onboarding failed.
pub async fn run_establish(config: &Config, attempt: &ConnectionAttempt, clock: Clock) -> i32 {
    let store = file_store(config);
    let liveness = ProcFs::new();
    let procedure = CommandProcedure::new(&config.onboarding, config.blacklist_dir());
    let signaller = KillCommand;
    let session = SignalSession::new(attempt.daemon_pid, &config.session, KillCommand);

    let coordinator = OnboardingCoordinator::new(
        &store,
        &liveness,
        &procedure,
        &signaller,
        config.onboarding.policy,
        Duration::from_secs(config.onboarding.wait_timeout),
        std::process::id(),
    );

    let outcome = coordinator.establish(attempt, &session, clock.unix).await;

    // Stamp the line with the end of the run, which may be much later
    let finished = Local::now();
    audit_log(config).record(
        Category::Established(&attempt.interface),
        finished,
        &format!(
            "{} {} remote={} mtu={} daemon={} started={}",
            outcome,
            attempt.peer_key,
            attempt.remote_address,
            attempt.mtu,
            attempt.daemon_pid,
            clock.local.format("%H:%M:%S"),
        ),
    );

    outcome.exit_code()
}

/// Describe the onboarding run state of `interface`
pub fn run_status(config: &Config, interface: &InterfaceName) -> String {
    let store = file_store(config);
    let liveness = ProcFs::new();
    let guard = SingleFlight::new(&store, &liveness);

    match guard.state(interface) {
        RunState::Idle => format!("{}: idle", interface),
        RunState::Running(record) => format!(
            "{}: running (owner {}, worker {}, since {})",
            interface,
            record.owner_pid,
            record
                .worker_pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.acquired_at
        ),
    }
}
