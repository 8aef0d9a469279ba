//! Daily audit files for hook decisions
//!
//! Each category gets one file per calendar day:
//!
//! - verify: `<log_dir>/<YYYYMMDD>_verify.log`
//! - established: `<log_dir>/<interface>_<YYYYMMDD>_established.log`
//!
//! After every write only the newest `retention` days of that category are
//! kept.

use crate::types::InterfaceName;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Kind of audit file
#[derive(Debug, Clone, Copy)]
pub enum Category<'a> {
    /// Decisions of the verify hook (all interfaces)
    Verify,
    /// Onboarding outcomes for one interface
    Established(&'a InterfaceName),
}

impl Category<'_> {
    /// File name for `day` (formatted `YYYYMMDD`)
    pub fn file_name(&self, day: &str) -> String {
        match self {
            Category::Verify => format!("{}_verify.log", day),
            Category::Established(iface) => format!("{}_{}_established.log", iface, day),
        }
    }

    /// Extract the day stamp if `name` belongs to this category
    pub fn day_of<'n>(&self, name: &'n str) -> Option<&'n str> {
        let day = match self {
            Category::Verify => name.strip_suffix("_verify.log")?,
            Category::Established(iface) => name
                .strip_prefix(iface.as_str())?
                .strip_prefix('_')?
                .strip_suffix("_established.log")?,
        };
        (day.len() == 8 && day.bytes().all(|b| b.is_ascii_digit())).then_some(day)
    }
}

/// Writer for the daily audit files
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    retention: usize,
}

impl AuditLog {
    /// Create a writer for `dir` keeping `retention` files per category
    pub fn new(dir: PathBuf, retention: usize) -> Self {
        Self { dir, retention }
    }

    /// Directory holding the audit files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `message` with a timestamp to today's file for `category`
    pub fn append(&self, category: Category<'_>, at: DateTime<Local>, message: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create log directory {}", self.dir.display()))?;

        let day = at.format("%Y%m%d").to_string();
        let path = self.dir.join(category.file_name(&day));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        // One write per line so concurrent hooks do not interleave
        let line = format!("{} {}\n", at.format("%Y-%m-%d %H:%M:%S"), message);
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(path)
    }

    /// Delete all but the newest `retention` files of `category`.
    /// Returns the paths that were removed.
    pub fn prune(&self, category: Category<'_>) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.dir.display()))
            }
        };

        let mut days: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let day = category.day_of(&name)?.to_string();
                Some((day, entry.path()))
            })
            .collect();

        // Newest first; YYYYMMDD sorts lexicographically
        days.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = Vec::new();
        for (_, path) in days.into_iter().skip(self.retention) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("Removed old log file {}", path.display());
                    removed.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }

    /// Append and prune, logging instead of failing
    pub fn record(&self, category: Category<'_>, at: DateTime<Local>, message: &str) {
        if let Err(e) = self.append(category, at, message) {
            log::warn!("Failed to write audit log: {:#}", e);
        }
        if let Err(e) = self.prune(category) {
            log::warn!("Failed to prune audit logs: {:#}", e);
        }
    }
}
