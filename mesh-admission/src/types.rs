// Shared types between the hooks and the stores

//! Shared data structures
//!
//! This module defines the validated identifiers used as record keys,
//! the ephemeral connection attempt handed to both hooks, the onboarding
//! run state, and the configuration structures.

use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Validates that a name is safe to use as a file name and in process arguments.
/// Only allows alphanumeric characters, hyphens, and underscores.
pub fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Identity of a connecting peer (the fastd public key)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey(String);

impl PeerKey {
    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        validate_name(s, "Peer key")?;
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the mesh VPN interface (one per segment, e.g. `vpn03`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName(String);

impl InterfaceName {
    /// Borrow the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing decimal digits of the interface name (`vpn03` -> `03`).
    /// Empty when the name does not end in a digit.
    pub fn segment(&self) -> &str {
        let digits = self
            .0
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .count();
        &self.0[self.0.len() - digits..]
    }
}

impl FromStr for InterfaceName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        validate_name(s, "Interface name")?;
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single inbound connection as reported by the VPN daemon.
/// Lives only for the duration of one hook invocation.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub peer_key: PeerKey,
    pub interface: InterfaceName,
    pub remote_address: String,
    /// Process id of the VPN daemon that invoked the hook
    pub daemon_pid: u32,
    pub mtu: u32,
}

/// Per-interface lock record marking an in-flight onboarding run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    /// Process id of the establish hook holding the lock
    pub owner_pid: u32,
    /// Start time of the owner in clock ticks since boot, so a recycled
    /// pid is not mistaken for the owner. `None` if it could not be read.
    pub owner_start: Option<u64>,
    /// Process id of the onboarding procedure, once spawned
    pub worker_pid: Option<u32>,
    /// UNIX seconds at acquisition
    pub acquired_at: u64,
}

/// Onboarding run state for one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No onboarding in flight
    Idle,
    /// Onboarding in flight under this lock
    Running(LockRecord),
}

/// What establish does when an onboarding run is already active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// Skip onboarding for the new connection
    Reject,
    /// Wait for the active run to finish, up to `wait_timeout`
    Wait,
    /// Terminate the active run and take over
    Preempt,
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConcurrencyPolicy::Reject => "reject",
            ConcurrencyPolicy::Wait => "wait",
            ConcurrencyPolicy::Preempt => "preempt",
        };
        f.write_str(s)
    }
}

/// Signals the hooks may deliver to other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Hup,
    Int,
    Term,
    Kill,
    Usr1,
    Usr2,
    Chld,
}

impl Signal {
    /// Signal name as understood by `kill -s`
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Hup => "HUP",
            Signal::Int => "INT",
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
            Signal::Chld => "CHLD",
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    pub onboarding: OnboardingConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root for lock records (and the blacklist unless overridden)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory for the daily verify/established audit files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Number of daily audit files kept per category
    #[serde(default = "default_log_retention")]
    pub log_retention: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            log_retention: default_log_retention(),
        }
    }
}

/// Blacklist configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BlacklistConfig {
    /// Directory holding one record per blocked peer.
    /// Defaults to `<state_dir>/blacklist`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Seconds a peer stays blocked
    #[serde(default = "default_block_ttl")]
    pub ttl: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl: default_block_ttl(),
        }
    }
}

/// Onboarding procedure configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OnboardingConfig {
    pub program: PathBuf,
    #[serde(default = "default_onboarding_args")]
    pub args: Vec<String>,
    /// Peer repository handed to the procedure as `{git_repo}`
    #[serde(default)]
    pub git_repo: Option<PathBuf>,
    #[serde(default = "default_policy")]
    pub policy: ConcurrencyPolicy,
    /// Seconds to wait for an active run under the `wait` policy
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: u64,
}

/// Signals used to escalate an onboarding failure to the daemon
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_drop_signal")]
    pub drop_signal: Signal,
    #[serde(default = "default_reap_signal")]
    pub reap_signal: Signal,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drop_signal: default_drop_signal(),
            reap_signal: default_reap_signal(),
        }
    }
}

impl Config {
    /// Directory holding the blacklist records
    pub fn blacklist_dir(&self) -> PathBuf {
        self.blacklist
            .dir
            .clone()
            .unwrap_or_else(|| self.general.state_dir.join("blacklist"))
    }

    /// Directory holding the per-interface lock records
    pub fn lock_dir(&self) -> PathBuf {
        self.general.state_dir.join("locks")
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/mesh-admission")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/mesh-admission")
}

fn default_log_retention() -> usize {
    3
}

fn default_block_ttl() -> u64 {
    600 // 10 minutes
}

fn default_onboarding_args() -> Vec<String> {
    [
        "--fastd",
        "{interface}",
        "--batman",
        "bat{segment}",
        "--peerkey",
        "{peer_key}",
        "--gitrepo",
        "{git_repo}",
        "--blacklist",
        "{blacklist_dir}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_policy() -> ConcurrencyPolicy {
    ConcurrencyPolicy::Reject
}

fn default_wait_timeout() -> u64 {
    120
}

fn default_drop_signal() -> Signal {
    Signal::Usr2
}

fn default_reap_signal() -> Signal {
    Signal::Chld
}
