// Onboarding coordinator (establish hook)

//! Single-flight onboarding with fail-closed escalation
//!
//! At most one onboarding run proceeds per interface. What happens to a
//! second establish while a run is active is decided by the configured
//! [`ConcurrencyPolicy`]. A failed run makes the whole daemon drop its
//! connections and reap its children; the next connection attempt is the
//! retry path.

use crate::onboarding::{OnboardingProcedure, ProcedureExit};
use crate::process::{Liveness, Signaller};
use crate::session::SessionController;
use crate::single_flight::{Claim, SingleFlight};
use crate::store::RunLockStore;
use crate::types::{ConcurrencyPolicy, ConnectionAttempt, InterfaceName, LockRecord, Signal};
use std::fmt;
use std::time::{Duration, Instant};

/// How often the `wait` policy re-checks the lock
const WAIT_POLL_INTERVAL_MILLIS: u64 = 500;

/// Why an onboarding run counts as failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The procedure ran and did not exit 0
    Exit(ProcedureExit),
    /// The procedure could not be started or awaited
    Error(String),
}

/// Result of an establish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstablishOutcome {
    /// Procedure exited 0; session left alone
    Succeeded,
    /// Procedure failed; drop-all and reap were sent to the daemon
    Failed(Failure),
    /// Another run holds the interface; nothing was started
    Rejected { holder: Option<u32> },
    /// This run was terminated by a preempting establish
    Preempted,
}

impl EstablishOutcome {
    /// Hook exit status: 1 only for provisioning failures
    pub fn exit_code(&self) -> i32 {
        match self {
            EstablishOutcome::Failed(_) => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for EstablishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstablishOutcome::Succeeded => write!(f, "SUCCESS"),
            EstablishOutcome::Failed(Failure::Exit(exit)) => write!(f, "FAILED ({})", exit),
            EstablishOutcome::Failed(Failure::Error(e)) => write!(f, "FAILED ({})", e),
            EstablishOutcome::Rejected { holder: Some(pid) } => {
                write!(f, "REJECTED (onboarding pid {} active)", pid)
            }
            EstablishOutcome::Rejected { holder: None } => {
                write!(f, "REJECTED (onboarding active)")
            }
            EstablishOutcome::Preempted => write!(f, "PREEMPTED"),
        }
    }
}

/// Coordinates onboarding runs for one establish invocation
pub struct OnboardingCoordinator<'a, L, P, O, K> {
    locks: &'a L,
    liveness: &'a P,
    procedure: &'a O,
    signaller: &'a K,
    policy: ConcurrencyPolicy,
    wait_timeout: Duration,
    poll_interval: Duration,
    owner_pid: u32,
}

impl<'a, L, P, O, K> OnboardingCoordinator<'a, L, P, O, K>
where
    L: RunLockStore + Sync,
    P: Liveness + Sync,
    O: OnboardingProcedure,
    K: Signaller,
{
    /// Create a coordinator whose lock records name `owner_pid`
    pub fn new(
        locks: &'a L,
        liveness: &'a P,
        procedure: &'a O,
        signaller: &'a K,
        policy: ConcurrencyPolicy,
        wait_timeout: Duration,
        owner_pid: u32,
    ) -> Self {
        Self {
            locks,
            liveness,
            procedure,
            signaller,
            policy,
            wait_timeout,
            poll_interval: Duration::from_millis(WAIT_POLL_INTERVAL_MILLIS),
            owner_pid,
        }
    }

    /// Override the lock polling interval of the `wait` policy
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run onboarding for `attempt`, escalating failures to `session`
    pub async fn establish<C: SessionController>(
        &self,
        attempt: &ConnectionAttempt,
        session: &C,
        now: u64,
    ) -> EstablishOutcome {
        let guard = SingleFlight::new(self.locks, self.liveness);
        let iface = &attempt.interface;
        let owner_start = match self.liveness.start_time(self.owner_pid) {
            Ok(started) => started,
            Err(e) => {
                log::debug!("Cannot read own start time: {:#}", e);
                None
            }
        };
        let record = LockRecord {
            owner_pid: self.owner_pid,
            owner_start,
            worker_pid: None,
            acquired_at: now,
        };

        let locked = match self.acquire(&guard, iface, &record).await {
            Ok(None) => true,
            Ok(Some(holder)) => {
                log::info!(
                    "Onboarding already active on {}, not onboarding {} (policy {})",
                    iface,
                    attempt.peer_key,
                    self.policy
                );
                return EstablishOutcome::Rejected {
                    holder: holder.map(|h| h.owner_pid),
                };
            }
            Err(e) => {
                log::warn!(
                    "Cannot take onboarding lock for {}, continuing without it: {:#}",
                    iface,
                    e
                );
                false
            }
        };

        let result = self
            .procedure
            .run(attempt, |pid| {
                if locked {
                    let with_worker = LockRecord {
                        worker_pid: Some(pid),
                        ..record
                    };
                    guard.set_worker(iface, &with_worker);
                }
            })
            .await;

        let preempted = locked && !guard.still_held(iface, self.owner_pid);
        if locked && !preempted {
            guard.release(iface, self.owner_pid);
        }

        let failure = match result {
            Ok(exit) if exit.is_success() => {
                log::info!("Onboarding of {} on {} succeeded", attempt.peer_key, iface);
                return EstablishOutcome::Succeeded;
            }
            _ if preempted => {
                log::warn!(
                    "Onboarding of {} on {} was preempted",
                    attempt.peer_key,
                    iface
                );
                return EstablishOutcome::Preempted;
            }
            Ok(exit) => Failure::Exit(exit),
            Err(e) => Failure::Error(format!("{:#}", e)),
        };

        log::error!(
            "Onboarding of {} on {} failed: {:?}; dropping sessions of daemon {}",
            attempt.peer_key,
            iface,
            failure,
            attempt.daemon_pid
        );
        escalate(session).await;

        EstablishOutcome::Failed(failure)
    }

    /// Take the lock according to the policy.
    /// `Ok(None)` means acquired, `Ok(Some(holder))` means rejected.
    async fn acquire(
        &self,
        guard: &SingleFlight<'_, L, P>,
        iface: &InterfaceName,
        record: &LockRecord,
    ) -> anyhow::Result<Option<Option<LockRecord>>> {
        let holder = match guard.try_claim(iface, record)? {
            Claim::Acquired => return Ok(None),
            Claim::Busy(holder) => holder,
        };

        match self.policy {
            ConcurrencyPolicy::Reject => Ok(Some(holder)),

            ConcurrencyPolicy::Wait => {
                // A deadline past what Instant can represent never expires
                let deadline = Instant::now().checked_add(self.wait_timeout);
                log::info!(
                    "Waiting up to {}s for onboarding on {} to finish",
                    self.wait_timeout.as_secs(),
                    iface
                );
                let mut holder = holder;
                while deadline.is_none_or(|d| Instant::now() < d) {
                    tokio::time::sleep(self.poll_interval).await;
                    match guard.try_claim(iface, record)? {
                        Claim::Acquired => return Ok(None),
                        Claim::Busy(h) => holder = h,
                    }
                }
                log::warn!("Timed out waiting for onboarding on {}", iface);
                Ok(Some(holder))
            }

            ConcurrencyPolicy::Preempt => {
                if let Some(h) = holder {
                    let target = h.worker_pid.unwrap_or(h.owner_pid);
                    if target != self.owner_pid {
                        log::warn!(
                            "Preempting onboarding on {} (owner {}, terminating pid {})",
                            iface,
                            h.owner_pid,
                            target
                        );
                        if let Err(e) = self.signaller.send(target, Signal::Term).await {
                            log::warn!("Failed to terminate pid {}: {:#}", target, e);
                        }
                    }
                }
                guard.discard(iface, holder.as_ref());

                match guard.try_claim(iface, record)? {
                    Claim::Acquired => Ok(None),
                    Claim::Busy(h) => Ok(Some(h)),
                }
            }
        }
    }
}

/// Tell the daemon to drop everything, then to reap its children
async fn escalate<C: SessionController>(session: &C) {
    if let Err(e) = session.drop_all().await {
        log::error!("Failed to drop daemon connections: {:#}", e);
    }
    if let Err(e) = session.reap().await {
        log::error!("Failed to reap daemon children: {:#}", e);
    }
}
