//! Configuration schema for resgraph
//!
//! Configuration is stored at `~/.config/resgraph/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Database settings
    pub database: DatabaseConfig,

    /// Check session expiry settings
    pub check_sessions: CheckSessionConfig,

    /// Garbage collection settings
    pub gc: GcConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Upper bound for check session windows (one year)
pub const MAX_SESSION_SECS: u64 = 365 * 24 * 60 * 60;

impl Config {
    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(format!(
                "general.log_format must be \"text\" or \"json\", got {:?}",
                self.general.log_format
            ));
        }
        if self.database.max_retries == 0 {
            return Err("database.max_retries must be at least 1".to_string());
        }
        if self.check_sessions.min_expiry_secs > self.check_sessions.max_expiry_secs {
            return Err(format!(
                "check_sessions.min_expiry_secs ({}) exceeds max_expiry_secs ({})",
                self.check_sessions.min_expiry_secs, self.check_sessions.max_expiry_secs
            ));
        }
        for (name, secs) in [
            ("check_sessions.grace_secs", self.check_sessions.grace_secs),
            ("check_sessions.min_expiry_secs", self.check_sessions.min_expiry_secs),
            ("check_sessions.max_expiry_secs", self.check_sessions.max_expiry_secs),
        ] {
            if secs > MAX_SESSION_SECS {
                return Err(format!("{} must be at most {} seconds", name, MAX_SESSION_SECS));
            }
        }
        if self.gc.interval_secs == 0 {
            return Err("gc.interval_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// SQLite store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file (defaults to the state directory)
    pub path: Option<PathBuf>,

    /// How long a writer waits on a locked database
    pub busy_timeout_ms: u64,

    /// Attempts for a transaction that keeps losing races
    pub max_retries: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 10_000,
            max_retries: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Reuse window for check sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSessionConfig {
    /// Sessions expiring sooner than this are not reused
    pub grace_secs: u64,

    /// Lower bound for a new session's lifetime
    pub min_expiry_secs: u64,

    /// Upper bound for a new session's lifetime
    pub max_expiry_secs: u64,
}

impl Default for CheckSessionConfig {
    fn default() -> Self {
        Self {
            grace_secs: 60,
            min_expiry_secs: 5 * 60,
            max_expiry_secs: 60 * 60,
        }
    }
}

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds between passes in `gc --watch`
    pub interval_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}
