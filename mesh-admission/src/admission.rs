// Admission decision engine (verify hook)

//! Accept/deny decision for an inbound connection
//!
//! The decision depends only on the current store contents and the clock,
//! so retried or duplicated verify calls for the same peer agree. Expired
//! blacklist entries are removed lazily by the lookup that notices them.

use crate::process::Liveness;
use crate::single_flight::SingleFlight;
use crate::store::{BlacklistStore, RunLockStore};
use crate::types::{InterfaceName, PeerKey, RunState};
use std::fmt;

/// Why a connection was accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptReason {
    /// Peer has no blacklist entry
    NotBlacklisted,
    /// Entry existed but its TTL had elapsed; it was removed
    BlacklistExpired { age: u64 },
    /// Entry could not be read; failing open
    StoreUnreadable,
}

/// Why a connection was denied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// An onboarding run is in flight on the interface
    OnboardingActive { owner_pid: u32 },
    /// Peer is blacklisted and the TTL has not elapsed
    Blacklisted { age: u64, remaining: u64 },
}

/// Outcome of a verify call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Let the connection through (exit 0)
    Accept(AcceptReason),
    /// Refuse the connection (exit 1)
    Deny(DenyReason),
}

impl Verdict {
    /// True for accepted connections
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }

    /// Hook exit status: 0 = accept, 1 = deny
    pub fn exit_code(&self) -> i32 {
        if self.is_accept() {
            0
        } else {
            1
        }
    }

    /// Short decision label for the audit log
    pub fn label(&self) -> &'static str {
        if self.is_accept() {
            "ACCEPT"
        } else {
            "DENY"
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept(AcceptReason::NotBlacklisted) => write!(f, "not blacklisted"),
            Verdict::Accept(AcceptReason::BlacklistExpired { age }) => {
                write!(f, "blacklist expired after {}s", age)
            }
            Verdict::Accept(AcceptReason::StoreUnreadable) => {
                write!(f, "blacklist record unreadable, failing open")
            }
            Verdict::Deny(DenyReason::OnboardingActive { owner_pid }) => {
                write!(f, "onboarding in progress (pid {})", owner_pid)
            }
            Verdict::Deny(DenyReason::Blacklisted { age, remaining }) => {
                write!(f, "blacklisted {}s ago, {}s remaining", age, remaining)
            }
        }
    }
}

/// Decision engine over a store and a liveness probe
pub struct AdmissionEngine<'a, S, P> {
    store: &'a S,
    liveness: &'a P,
    block_ttl: u64,
}

impl<'a, S, P> AdmissionEngine<'a, S, P>
where
    S: BlacklistStore + RunLockStore,
    P: Liveness,
{
    /// Create an engine. `block_ttl` is in seconds.
    pub fn new(store: &'a S, liveness: &'a P, block_ttl: u64) -> Self {
        Self {
            store,
            liveness,
            block_ttl,
        }
    }

    /// Decide whether `peer` may connect on `interface` at UNIX time `now`
    pub fn verify(&self, peer: &PeerKey, interface: &InterfaceName, now: u64) -> Verdict {
        let guard = SingleFlight::new(self.store, self.liveness);
        if let RunState::Running(record) = guard.state(interface) {
            return Verdict::Deny(DenyReason::OnboardingActive {
                owner_pid: record.owner_pid,
            });
        }

        let blocked_at = match self.store.get(peer) {
            Ok(Some(blocked_at)) => blocked_at,
            Ok(None) => return Verdict::Accept(AcceptReason::NotBlacklisted),
            Err(e) => {
                log::warn!("Treating {} as not blacklisted: {:#}", peer, e);
                return Verdict::Accept(AcceptReason::StoreUnreadable);
            }
        };

        // A timestamp from the future counts as "just blocked"
        let age = now.saturating_sub(blocked_at);

        if age >= self.block_ttl {
            if let Err(e) = self.store.delete(peer) {
                log::warn!("Failed to remove expired blacklist entry for {}: {:#}", peer, e);
            }
            log::info!("Blacklist entry for {} expired after {}s", peer, age);
            Verdict::Accept(AcceptReason::BlacklistExpired { age })
        } else {
            Verdict::Deny(DenyReason::Blacklisted {
                age,
                remaining: self.block_ttl - age,
            })
        }
    }
}
