// Mesh VPN admission control library
// Shared modules for the hook binary and tests

#![warn(missing_docs)]

//! Mesh VPN Admission Control Library
//!
//! This library implements the verify and establish hooks that sit between a
//! mesh VPN daemon and the slow onboarding procedure provisioning new peers:
//! the accept/deny decision for inbound connections, the per-interface
//! single-flight guard for onboarding runs, and the fail-closed teardown
//! when onboarding fails.
//!
//! # Main Components
//!
//! - [`admission`]: Accept/deny decision engine (verify hook)
//! - [`coordinator`]: Single-flight onboarding coordinator (establish hook)
//! - [`store`]: Blacklist and run-lock store traits, in-memory backend
//! - [`fs_store`]: File-per-record store backend
//! - [`single_flight`]: Lock discipline with stale-owner detection
//! - [`onboarding`]: External onboarding procedure launcher
//! - [`session`]: Daemon teardown capability
//! - [`process`]: Process liveness and signal delivery
//! - [`audit_log`]: Daily audit files with retention
//! - [`hooks`]: Hook entry points wiring the above together
//! - [`config`]: Configuration file parsing and validation
//! - [`types`]: Shared data structures

pub mod admission;
pub mod audit_log;
pub mod config;
pub mod coordinator;
pub mod fs_store;
pub mod hooks;
pub mod onboarding;
pub mod process;
pub mod session;
pub mod single_flight;
pub mod store;
pub mod types;
