// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files and validating
//! their contents, including the onboarding argument templates.

use crate::onboarding::PLACEHOLDERS;
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Upper bound for the blacklist TTL (one week)
const MAX_BLOCK_TTL_SECS: u64 = 7 * 24 * 3600;

/// Upper bound for waiting on an active onboarding run (one day)
const MAX_WAIT_TIMEOUT_SECS: u64 = 24 * 3600;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    parse_config(&contents)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.blacklist.ttl == 0 {
        anyhow::bail!("blacklist.ttl must be > 0");
    }

    if config.blacklist.ttl > MAX_BLOCK_TTL_SECS {
        anyhow::bail!(
            "blacklist.ttl must be <= {}s, got {}s",
            MAX_BLOCK_TTL_SECS,
            config.blacklist.ttl
        );
    }

    if config.general.log_retention == 0 {
        anyhow::bail!("general.log_retention must be > 0");
    }

    if config.onboarding.wait_timeout > MAX_WAIT_TIMEOUT_SECS {
        anyhow::bail!(
            "onboarding.wait_timeout must be <= {}s, got {}s",
            MAX_WAIT_TIMEOUT_SECS,
            config.onboarding.wait_timeout
        );
    }

    if config.onboarding.program.as_os_str().is_empty() {
        anyhow::bail!("onboarding.program cannot be empty");
    }

    for arg in &config.onboarding.args {
        check_placeholders(arg).with_context(|| format!("Invalid onboarding argument: {}", arg))?;
    }

    let uses_git_repo = config
        .onboarding
        .args
        .iter()
        .any(|a| a.contains("{git_repo}"));
    if uses_git_repo && config.onboarding.git_repo.is_none() {
        anyhow::bail!("onboarding.args reference {{git_repo}} but onboarding.git_repo is not set");
    }

    if config.session.drop_signal == config.session.reap_signal {
        log::warn!(
            "session.drop_signal and session.reap_signal are both {}",
            config.session.drop_signal.name()
        );
    }

    Ok(())
}

/// Ensure every `{...}` in an argument template names a known placeholder
fn check_placeholders(arg: &str) -> Result<()> {
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .context("Unterminated placeholder (missing '}')")?;
        let name = &after[..end];
        if !PLACEHOLDERS.contains(&name) {
            anyhow::bail!("Unknown placeholder {{{}}}", name);
        }
        rest = &after[end + 1..];
    }
    Ok(())
}
